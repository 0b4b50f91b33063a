//! Dead-letter queue: parks unrecoverable node failures with full context.
//! Two implementations — in-memory (sweep-on-TTL) and file-backed (one JSON
//! document per id).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{error, warn};
use uuid::Uuid;

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqErrorInfo {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub node_id: String,
    pub state: Value,
    pub input: Value,
    pub error: DlqErrorInfo,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub tags: Vec<String>,
    pub metadata: Value,
    pub last_attempt: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub workflow_id: Option<Uuid>,
    pub workflow_name: Option<String>,
    pub node_id: Option<String>,
    pub min_attempts: Option<u32>,
    pub max_attempts: Option<u32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// All-of: every tag listed must be present on the entry.
    pub tags: Vec<String>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

impl DlqFilter {
    fn matches(&self, e: &DlqEntry) -> bool {
        if let Some(id) = self.workflow_id {
            if e.workflow_id != id {
                return false;
            }
        }
        if let Some(name) = &self.workflow_name {
            if &e.workflow_name != name {
                return false;
            }
        }
        if let Some(node_id) = &self.node_id {
            if &e.node_id != node_id {
                return false;
            }
        }
        if let Some(min) = self.min_attempts {
            if e.attempts < min {
                return false;
            }
        }
        if let Some(max) = self.max_attempts {
            if e.attempts > max {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if e.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if e.created_at > before {
                return false;
            }
        }
        self.tags.iter().all(|t| e.tags.contains(t))
    }
}

#[async_trait]
pub trait DeadLetterQueue: Send + Sync {
    async fn add(&self, entry: DlqEntry) -> Result<Uuid, EngineError>;
    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, EngineError>;
    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, EngineError>;
    async fn count(&self, filter: &DlqFilter) -> Result<usize, EngineError>;
    async fn retry(&self, id: Uuid) -> Result<DlqEntry, EngineError>;
    async fn remove(&self, id: Uuid) -> Result<(), EngineError>;
    async fn clear(&self) -> Result<(), EngineError>;
}

fn apply_listing(mut entries: Vec<DlqEntry>, filter: &DlqFilter) -> Vec<DlqEntry> {
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let offset = filter.offset.unwrap_or(0);
    let entries: Vec<DlqEntry> = entries.into_iter().skip(offset).collect();
    match filter.limit {
        Some(limit) => entries.into_iter().take(limit).collect(),
        None => entries,
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

pub struct InMemoryDlq {
    entries: Arc<DashMap<Uuid, DlqEntry>>,
    disposed: Arc<AtomicBool>,
}

impl InMemoryDlq {
    pub fn new() -> Self {
        Self { entries: Arc::new(DashMap::new()), disposed: Arc::new(AtomicBool::new(false)) }
    }

    /// Spawns a background sweeper that removes expired entries every
    /// `interval`. Returns a handle the caller must abort on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let entries = self.entries.clone();
        let disposed = self.disposed.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if disposed.load(Ordering::Acquire) {
                    break;
                }
                let now = Utc::now();
                entries.retain(|_, e| e.expires_at > now);
            }
        })
    }

    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Release);
    }
}

impl Default for InMemoryDlq {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeadLetterQueue for InMemoryDlq {
    async fn add(&self, entry: DlqEntry) -> Result<Uuid, EngineError> {
        let id = entry.id;
        self.entries.insert(id, entry);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, EngineError> {
        let now = Utc::now();
        Ok(self.entries.get(&id).filter(|e| e.expires_at > now).map(|e| e.clone()))
    }

    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, EngineError> {
        let now = Utc::now();
        let matching: Vec<DlqEntry> =
            self.entries.iter().map(|e| e.clone()).filter(|e| e.expires_at > now && filter.matches(e)).collect();
        Ok(apply_listing(matching, filter))
    }

    async fn count(&self, filter: &DlqFilter) -> Result<usize, EngineError> {
        let now = Utc::now();
        Ok(self.entries.iter().filter(|e| e.expires_at > now && filter.matches(&e)).count())
    }

    async fn retry(&self, id: Uuid) -> Result<DlqEntry, EngineError> {
        let mut entry = self.entries.get_mut(&id).ok_or_else(|| EngineError::DlqEntryNotFound(id))?;
        entry.attempts += 1;
        entry.last_attempt = Some(Utc::now());
        Ok(entry.clone())
    }

    async fn remove(&self, id: Uuid) -> Result<(), EngineError> {
        self.entries.remove(&id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), EngineError> {
        self.entries.clear();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File-backed implementation
// ---------------------------------------------------------------------------

/// Persists one JSON document per entry at `<dir>/<id>.json`. TTL is
/// enforced lazily on read; expired files are deleted as they're observed
/// rather than proactively swept.
pub struct FileDlq {
    dir: PathBuf,
}

impl FileDlq {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await.map_err(|e| EngineError::Io(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn read_entry(path: &Path) -> Option<DlqEntry> {
        let bytes = fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn read_all(&self) -> Result<Vec<DlqEntry>, EngineError> {
        let mut out = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await.map_err(|e| EngineError::Io(e.to_string()))?;
        let now = Utc::now();
        while let Some(entry) = dir.next_entry().await.map_err(|e| EngineError::Io(e.to_string()))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(parsed) = Self::read_entry(&path).await {
                if parsed.expires_at <= now {
                    if let Err(e) = fs::remove_file(&path).await {
                        warn!(?path, error = %e, "failed to lazily expire dlq file");
                    }
                    continue;
                }
                out.push(parsed);
            } else {
                error!(?path, "failed to parse dlq entry file, skipping");
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl DeadLetterQueue for FileDlq {
    async fn add(&self, entry: DlqEntry) -> Result<Uuid, EngineError> {
        let id = entry.id;
        let bytes = serde_json::to_vec_pretty(&entry).map_err(|e| EngineError::Io(e.to_string()))?;
        fs::write(self.path_for(id), bytes).await.map_err(|e| EngineError::Io(e.to_string()))?;
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DlqEntry>, EngineError> {
        let path = self.path_for(id);
        match Self::read_entry(&path).await {
            Some(entry) if entry.expires_at > Utc::now() => Ok(Some(entry)),
            Some(_) => {
                let _ = fs::remove_file(&path).await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, EngineError> {
        let all = self.read_all().await?;
        Ok(apply_listing(all.into_iter().filter(|e| filter.matches(e)).collect(), filter))
    }

    async fn count(&self, filter: &DlqFilter) -> Result<usize, EngineError> {
        Ok(self.read_all().await?.into_iter().filter(|e| filter.matches(e)).count())
    }

    async fn retry(&self, id: Uuid) -> Result<DlqEntry, EngineError> {
        let mut entry = self.get(id).await?.ok_or(EngineError::DlqEntryNotFound(id))?;
        entry.attempts += 1;
        entry.last_attempt = Some(Utc::now());
        self.add(entry.clone()).await?;
        Ok(entry)
    }

    async fn remove(&self, id: Uuid) -> Result<(), EngineError> {
        let _ = fs::remove_file(self.path_for(id)).await;
        Ok(())
    }

    async fn clear(&self) -> Result<(), EngineError> {
        let mut dir = fs::read_dir(&self.dir).await.map_err(|e| EngineError::Io(e.to_string()))?;
        while let Some(entry) = dir.next_entry().await.map_err(|e| EngineError::Io(e.to_string()))? {
            let _ = fs::remove_file(entry.path()).await;
        }
        Ok(())
    }
}
