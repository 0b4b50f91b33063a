//! Run-record persistence backing `engine::run_store::RunStore`.
//!
//! Pure SQL over the projected columns plus the `data` JSONB document; the
//! engine crate owns the translation to/from `RunRecord` (this crate never
//! depends on `engine`, mirroring the split the teacher draws between `db`
//! and the domain crates above it).

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{models::RunRow, DbError};

/// Insert a new run row, or overwrite it in place (the manager upserts the
/// full document on every status transition rather than issuing a partial
/// `UPDATE`, since `RunStore::update`'s read-modify-write happens in the
/// engine crate against an in-memory copy of the record).
#[allow(clippy::too_many_arguments)]
pub async fn upsert_run(
    pool: &PgPool,
    id: Uuid,
    workflow_id: Uuid,
    workflow_name: &str,
    status: &str,
    priority: i32,
    scheduled_for: i64,
    tags: &[String],
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    data: serde_json::Value,
) -> Result<RunRow, DbError> {
    let row = sqlx::query_as!(
        RunRow,
        r#"
        INSERT INTO runs
            (id, workflow_id, workflow_name, status, priority, scheduled_for, tags,
             created_at, started_at, completed_at, data)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE SET
            status = EXCLUDED.status,
            priority = EXCLUDED.priority,
            scheduled_for = EXCLUDED.scheduled_for,
            tags = EXCLUDED.tags,
            started_at = EXCLUDED.started_at,
            completed_at = EXCLUDED.completed_at,
            data = EXCLUDED.data
        RETURNING id, workflow_id, workflow_name, status, priority, scheduled_for,
                  tags, created_at, started_at, completed_at, data
        "#,
        id,
        workflow_id,
        workflow_name,
        status,
        priority,
        scheduled_for,
        tags,
        created_at,
        started_at,
        completed_at,
        data,
    )
    .fetch_one(pool)
    .await?;

    Ok(row)
}

pub async fn get_run(pool: &PgPool, id: Uuid) -> Result<Option<RunRow>, DbError> {
    let row = sqlx::query_as!(
        RunRow,
        r#"SELECT id, workflow_id, workflow_name, status, priority, scheduled_for,
                  tags, created_at, started_at, completed_at, data
           FROM runs WHERE id = $1"#,
        id,
    )
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Filter parameters for [`list_runs`]/[`count_runs`]. An empty `statuses`
/// or `tags` list means "no constraint on that field" — matching
/// `engine::models::RunFilter`'s own convention.
#[derive(Debug, Default)]
pub struct RunListFilter<'a> {
    pub workflow_id: Option<Uuid>,
    pub workflow_name: Option<&'a str>,
    pub statuses: &'a [String],
    pub tags: &'a [String],
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

pub async fn list_runs(pool: &PgPool, filter: &RunListFilter<'_>, limit: Option<i64>, offset: Option<i64>) -> Result<Vec<RunRow>, DbError> {
    let rows = sqlx::query_as!(
        RunRow,
        r#"
        SELECT id, workflow_id, workflow_name, status, priority, scheduled_for,
               tags, created_at, started_at, completed_at, data
        FROM runs
        WHERE ($1::uuid IS NULL OR workflow_id = $1)
          AND ($2::text IS NULL OR workflow_name = $2)
          AND (array_length($3::text[], 1) IS NULL OR status = ANY($3))
          AND (array_length($4::text[], 1) IS NULL OR tags @> $4)
          AND ($5::timestamptz IS NULL OR created_at >= $5)
          AND ($6::timestamptz IS NULL OR created_at <= $6)
        ORDER BY created_at DESC
        LIMIT $7 OFFSET $8
        "#,
        filter.workflow_id,
        filter.workflow_name,
        filter.statuses,
        filter.tags,
        filter.created_after,
        filter.created_before,
        limit.unwrap_or(i64::MAX),
        offset.unwrap_or(0),
    )
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn count_runs(pool: &PgPool, filter: &RunListFilter<'_>) -> Result<i64, DbError> {
    let count = sqlx::query_scalar!(
        r#"
        SELECT COUNT(*) AS "count!"
        FROM runs
        WHERE ($1::uuid IS NULL OR workflow_id = $1)
          AND ($2::text IS NULL OR workflow_name = $2)
          AND (array_length($3::text[], 1) IS NULL OR status = ANY($3))
          AND (array_length($4::text[], 1) IS NULL OR tags @> $4)
          AND ($5::timestamptz IS NULL OR created_at >= $5)
          AND ($6::timestamptz IS NULL OR created_at <= $6)
        "#,
        filter.workflow_id,
        filter.workflow_name,
        filter.statuses,
        filter.tags,
        filter.created_after,
        filter.created_before,
    )
    .fetch_one(pool)
    .await?;

    Ok(count)
}

/// `(status, count)` pairs for every status present, for `RunStats::by_status`.
pub async fn count_by_status(pool: &PgPool) -> Result<Vec<(String, i64)>, DbError> {
    let rows = sqlx::query!(r#"SELECT status AS "status!", COUNT(*) AS "count!" FROM runs GROUP BY status"#)
        .fetch_all(pool)
        .await?;

    Ok(rows.into_iter().map(|r| (r.status, r.count)).collect())
}

/// Average `completed_at - started_at` in milliseconds across `status =
/// 'Completed'` runs that recorded both timestamps. `None` if there are none.
pub async fn avg_completed_duration_ms(pool: &PgPool) -> Result<Option<f64>, DbError> {
    let avg = sqlx::query_scalar!(
        r#"
        SELECT AVG(EXTRACT(EPOCH FROM (completed_at - started_at)) * 1000.0) AS "avg_ms"
        FROM runs
        WHERE status = 'Completed' AND started_at IS NOT NULL AND completed_at IS NOT NULL
        "#,
    )
    .fetch_one(pool)
    .await?;

    Ok(avg)
}

pub async fn total_run_count(pool: &PgPool) -> Result<i64, DbError> {
    let count = sqlx::query_scalar!(r#"SELECT COUNT(*) AS "count!" FROM runs"#).fetch_one(pool).await?;
    Ok(count)
}

/// Deletes terminal runs (`Completed`/`Failed`/`Cancelled`) whose
/// `completed_at` is older than `cutoff`. Returns the number removed.
pub async fn delete_completed_before(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
    let result = sqlx::query!(
        r#"
        DELETE FROM runs
        WHERE status IN ('Completed', 'Failed', 'Cancelled')
          AND completed_at IS NOT NULL
          AND completed_at < $1
        "#,
        cutoff,
    )
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
