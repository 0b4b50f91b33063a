//! The boundary between a concrete trigger (cron/webhook/event) and
//! whatever actually creates a run. The engine's manager implements this.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::TriggerError;

/// Which trigger kind produced a firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Cron,
    Webhook,
    Event,
}

/// Context handed to the sink alongside the workflow name that should run.
#[derive(Debug, Clone)]
pub struct FireContext {
    pub trigger_id: Uuid,
    pub trigger_type: TriggerType,
    pub payload: Value,
    pub tags: Vec<String>,
    pub next_fire_at: Option<DateTime<Utc>>,
}

/// Implemented by whatever turns a firing into a new run — in this crate's
/// tests, a recording stub; in the full engine, `engine::manager::Manager`.
#[async_trait]
pub trait FireSink: Send + Sync {
    async fn fire(&self, workflow_name: &str, ctx: FireContext) -> Result<Uuid, TriggerError>;
}
