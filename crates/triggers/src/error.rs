//! Error type for the `triggers` crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("invalid cron expression '{0}': {1}")]
    InvalidCronExpression(String, String),

    #[error("no trigger registered with id '{0}'")]
    NotFound(uuid::Uuid),

    #[error("sink rejected firing: {0}")]
    SinkRejected(String),
}
