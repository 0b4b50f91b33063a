//! Row structs that map 1-to-1 onto database tables.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Domain types live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// workflows
// ---------------------------------------------------------------------------

/// A persisted workflow definition row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WorkflowRow {
    pub id: Uuid,
    pub name: String,
    /// Full JSON workflow definition (nodes, edges, trigger, …)
    pub definition: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// secrets
// ---------------------------------------------------------------------------

/// A persisted secret row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SecretRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub key: String,
    /// AES-256 encrypted value (base64-encoded ciphertext).
    pub encrypted_value: String,
}

// ---------------------------------------------------------------------------
// runs
// ---------------------------------------------------------------------------

/// A persisted workflow run row backing `engine::run_store::RunStore`.
///
/// `data` carries the full serialised `engine::models::RunRecord`; the
/// remaining columns are a queryable projection of it so list/count
/// filters run in SQL rather than pulling every row into memory.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RunRow {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: String,
    pub priority: i32,
    pub scheduled_for: i64,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub data: serde_json::Value,
}
