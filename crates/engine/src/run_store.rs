//! Persists run metadata and status transitions; queries with filters;
//! computes stats. The manager is the only writer; `RunFilter` queries are
//! read-only per §6's external interfaces.
//!
//! `InMemoryRunStore` is the always-available default. `db::repository::runs`
//! provides an optional Postgres-backed implementation of the same trait,
//! matching the `DeadLetterQueue` in-memory/file-backed split's precedent of
//! a default plus one pluggable backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{RunFilter, RunRecord, RunStats, RunStatus};

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn save(&self, run: RunRecord) -> Result<(), EngineError>;
    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, EngineError>;
    async fn update(&self, id: Uuid, patch: Box<dyn FnOnce(&mut RunRecord) + Send>) -> Result<RunRecord, EngineError>;
    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, EngineError>;
    async fn count(&self, filter: &RunFilter) -> Result<usize, EngineError>;
    async fn get_stats(&self) -> Result<RunStats, EngineError>;
    /// Removes terminal runs whose `completed_at` is older than `older_than_ms`.
    async fn cleanup(&self, older_than_ms: i64) -> Result<usize, EngineError>;
}

fn matches(run: &RunRecord, filter: &RunFilter) -> bool {
    if let Some(id) = filter.workflow_id {
        if run.workflow_id != id {
            return false;
        }
    }
    if let Some(name) = &filter.workflow_name {
        if &run.workflow_name != name {
            return false;
        }
    }
    if !filter.status.is_empty() && !filter.status.contains(&run.status) {
        return false;
    }
    if !filter.tags.is_empty() && !filter.tags.iter().all(|t| run.tags.contains(t)) {
        return false;
    }
    if let Some(after) = filter.created_after {
        if run.created_at < after {
            return false;
        }
    }
    if let Some(before) = filter.created_before {
        if run.created_at > before {
            return false;
        }
    }
    true
}

fn apply_listing(mut runs: Vec<RunRecord>, filter: &RunFilter) -> Vec<RunRecord> {
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let offset = filter.offset.unwrap_or(0);
    let runs: Vec<RunRecord> = runs.into_iter().skip(offset).collect();
    match filter.limit {
        Some(limit) => runs.into_iter().take(limit).collect(),
        None => runs,
    }
}

/// Default, always-available `RunStore`. Shared by reference across the
/// manager and every executor it spawns.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: DashMap<Uuid, RunRecord>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn save(&self, run: RunRecord) -> Result<(), EngineError> {
        self.runs.insert(run.id, run);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, EngineError> {
        Ok(self.runs.get(&id).map(|r| r.clone()))
    }

    async fn update(&self, id: Uuid, patch: Box<dyn FnOnce(&mut RunRecord) + Send>) -> Result<RunRecord, EngineError> {
        let mut entry = self.runs.get_mut(&id).ok_or(EngineError::RunNotFound(id))?;
        patch(&mut entry);
        Ok(entry.clone())
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, EngineError> {
        let matching: Vec<RunRecord> = self.runs.iter().map(|r| r.clone()).filter(|r| matches(r, filter)).collect();
        Ok(apply_listing(matching, filter))
    }

    async fn count(&self, filter: &RunFilter) -> Result<usize, EngineError> {
        Ok(self.runs.iter().filter(|r| matches(&r, filter)).count())
    }

    async fn get_stats(&self) -> Result<RunStats, EngineError> {
        let mut stats = RunStats::default();
        let mut total_duration_ms: f64 = 0.0;
        let mut completed_count: u64 = 0;

        for entry in self.runs.iter() {
            let run = entry.value();
            stats.total += 1;
            let key = format!("{:?}", run.status).to_lowercase();
            *stats.by_status.entry(key).or_insert(0) += 1;

            // Average duration counts completed runs only — a run still
            // `Running` has no `completed_at` and must not skew this stat.
            if run.status == crate::models::RunStatus::Completed {
                if let (Some(started), Some(completed)) = (run.started_at, run.completed_at) {
                    total_duration_ms += (completed - started).num_milliseconds() as f64;
                    completed_count += 1;
                }
            }
        }

        stats.avg_completed_duration_ms =
            if completed_count > 0 { Some(total_duration_ms / completed_count as f64) } else { None };

        Ok(stats)
    }

    async fn cleanup(&self, older_than_ms: i64) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than_ms);
        let to_remove: Vec<Uuid> = self
            .runs
            .iter()
            .filter(|r| r.status.is_terminal() && r.completed_at.map(|c| c < cutoff).unwrap_or(false))
            .map(|r| r.id)
            .collect();
        for id in &to_remove {
            self.runs.remove(id);
        }
        Ok(to_remove.len())
    }
}

/// Convenience alias for the shared handle the manager hands to executors.
pub type SharedRunStore = Arc<dyn RunStore>;

/// Postgres-backed `RunStore`, for deployments that want runs to survive a
/// process restart. The full `RunRecord` rides as one JSONB document (the
/// `db` crate never depends on `engine`, so it can't speak this type
/// directly — see `db::repository::runs`); the projected columns alongside
/// it let `list`/`count`/`get_stats` push filtering into SQL.
pub struct PgRunStore {
    pool: db::DbPool,
}

impl PgRunStore {
    pub fn new(pool: db::DbPool) -> Self {
        Self { pool }
    }
}

fn status_str(status: RunStatus) -> String {
    format!("{status:?}")
}

fn row_to_run(row: db::models::RunRow) -> Result<RunRecord, EngineError> {
    serde_json::from_value(row.data).map_err(|e| EngineError::Io(format!("corrupt run row: {e}")))
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn save(&self, run: RunRecord) -> Result<(), EngineError> {
        let data = serde_json::to_value(&run).map_err(|e| EngineError::Io(e.to_string()))?;
        db::repository::runs::upsert_run(
            &self.pool,
            run.id,
            run.workflow_id,
            &run.workflow_name,
            &status_str(run.status),
            run.priority,
            run.scheduled_for,
            &run.tags,
            run.created_at,
            run.started_at,
            run.completed_at,
            data,
        )
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<RunRecord>, EngineError> {
        match db::repository::runs::get_run(&self.pool, id).await? {
            Some(row) => Ok(Some(row_to_run(row)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, id: Uuid, patch: Box<dyn FnOnce(&mut RunRecord) + Send>) -> Result<RunRecord, EngineError> {
        let row = db::repository::runs::get_run(&self.pool, id).await?.ok_or(EngineError::RunNotFound(id))?;
        let mut run = row_to_run(row)?;
        patch(&mut run);
        self.save(run.clone()).await?;
        Ok(run)
    }

    async fn list(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, EngineError> {
        let owned_filter = OwnedFilter::from(filter);
        let params = owned_filter.as_params();
        let limit = filter.limit.map(|l| l as i64);
        let offset = filter.offset.map(|o| o as i64);
        let rows = db::repository::runs::list_runs(&self.pool, &params, limit, offset).await?;
        rows.into_iter().map(row_to_run).collect()
    }

    async fn count(&self, filter: &RunFilter) -> Result<usize, EngineError> {
        let owned_filter = OwnedFilter::from(filter);
        let params = owned_filter.as_params();
        let count = db::repository::runs::count_runs(&self.pool, &params).await?;
        Ok(count as usize)
    }

    async fn get_stats(&self) -> Result<RunStats, EngineError> {
        let total = db::repository::runs::total_run_count(&self.pool).await? as u64;
        let by_status = db::repository::runs::count_by_status(&self.pool)
            .await?
            .into_iter()
            .map(|(status, count)| (status.to_lowercase(), count as u64))
            .collect();
        let avg_completed_duration_ms = db::repository::runs::avg_completed_duration_ms(&self.pool).await?;
        Ok(RunStats { total, by_status, avg_completed_duration_ms })
    }

    async fn cleanup(&self, older_than_ms: i64) -> Result<usize, EngineError> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than_ms);
        let removed = db::repository::runs::delete_completed_before(&self.pool, cutoff).await?;
        Ok(removed as usize)
    }
}

/// `RunFilter`'s status enum and borrowed `&str` fields need owning for the
/// `'a` lifetime `RunListFilter` borrows from; this bridges the two without
/// changing `RunFilter`'s shape (which `InMemoryRunStore` also matches
/// against directly).
struct OwnedFilter {
    workflow_id: Option<Uuid>,
    workflow_name: Option<String>,
    statuses: Vec<String>,
    tags: Vec<String>,
    created_after: Option<chrono::DateTime<Utc>>,
    created_before: Option<chrono::DateTime<Utc>>,
}

impl From<&RunFilter> for OwnedFilter {
    fn from(filter: &RunFilter) -> Self {
        Self {
            workflow_id: filter.workflow_id,
            workflow_name: filter.workflow_name.clone(),
            statuses: filter.status.iter().copied().map(status_str).collect(),
            tags: filter.tags.clone(),
            created_after: filter.created_after,
            created_before: filter.created_before,
        }
    }
}

impl OwnedFilter {
    fn as_params(&self) -> db::repository::runs::RunListFilter<'_> {
        db::repository::runs::RunListFilter {
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name.as_deref(),
            statuses: &self.statuses,
            tags: &self.tags,
            created_after: self.created_after,
            created_before: self.created_before,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RunStatus;
    use serde_json::json;

    fn sample_run(workflow_name: &str, status: RunStatus) -> RunRecord {
        let mut run = RunRecord::new(Uuid::new_v4(), workflow_name, json!({}), 0, 0, vec![]);
        run.status = status;
        run
    }

    #[tokio::test]
    async fn save_and_get_round_trips() {
        let store = InMemoryRunStore::new();
        let run = sample_run("wf", RunStatus::Pending);
        let id = run.id;
        store.save(run).await.unwrap();
        let fetched = store.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.workflow_name, "wf");
    }

    #[tokio::test]
    async fn update_applies_patch_and_returns_new_state() {
        let store = InMemoryRunStore::new();
        let run = sample_run("wf", RunStatus::Pending);
        let id = run.id;
        store.save(run).await.unwrap();
        let updated = store.update(id, Box::new(|r| r.status = RunStatus::Running)).await.unwrap();
        assert_eq!(updated.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn update_missing_run_errors() {
        let store = InMemoryRunStore::new();
        let result = store.update(Uuid::new_v4(), Box::new(|_| {})).await;
        assert!(matches!(result, Err(EngineError::RunNotFound(_))));
    }

    #[tokio::test]
    async fn stats_average_duration_excludes_still_running_runs() {
        let store = InMemoryRunStore::new();

        let mut completed = sample_run("wf", RunStatus::Completed);
        completed.started_at = Some(Utc::now() - chrono::Duration::seconds(10));
        completed.completed_at = Some(Utc::now());
        store.save(completed).await.unwrap();

        let mut running = sample_run("wf", RunStatus::Running);
        running.started_at = Some(Utc::now() - chrono::Duration::seconds(1000));
        store.save(running).await.unwrap();

        let stats = store.get_stats().await.unwrap();
        assert_eq!(stats.total, 2);
        let avg = stats.avg_completed_duration_ms.unwrap();
        assert!(avg > 9000.0 && avg < 11000.0, "avg={avg} should reflect only the completed run");
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_runs() {
        let store = InMemoryRunStore::new();

        let mut old_completed = sample_run("wf", RunStatus::Completed);
        old_completed.completed_at = Some(Utc::now() - chrono::Duration::days(2));
        let old_id = old_completed.id;
        store.save(old_completed).await.unwrap();

        let mut recent_completed = sample_run("wf", RunStatus::Completed);
        recent_completed.completed_at = Some(Utc::now());
        let recent_id = recent_completed.id;
        store.save(recent_completed).await.unwrap();

        let still_running = sample_run("wf", RunStatus::Running);
        let running_id = still_running.id;
        store.save(still_running).await.unwrap();

        let removed = store.cleanup(chrono::Duration::days(1).num_milliseconds()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(old_id).await.unwrap().is_none());
        assert!(store.get(recent_id).await.unwrap().is_some());
        assert!(store.get(running_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_filters_by_status_and_sorts_newest_first() {
        let store = InMemoryRunStore::new();
        let mut older = sample_run("wf", RunStatus::Failed);
        older.created_at = Utc::now() - chrono::Duration::hours(1);
        let newer = sample_run("wf", RunStatus::Failed);
        store.save(older).await.unwrap();
        store.save(newer.clone()).await.unwrap();
        store.save(sample_run("wf", RunStatus::Completed)).await.unwrap();

        let filter = RunFilter { status: vec![RunStatus::Failed], ..Default::default() };
        let list = store.list(&filter).await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, newer.id);
    }
}
