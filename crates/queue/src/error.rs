//! Error type for the `queue` crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no entry found for run '{0}'")]
    NotFound(uuid::Uuid),
}
