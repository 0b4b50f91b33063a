//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node's `execute` method.
///
/// The engine's retry classifier uses the variant (and, for `Fatal`, the
/// message) to decide whether to re-try:
/// - `Retryable` / `Timeout` — always considered for retry.
/// - `Fatal`                — retried only if it looks network-like.
/// - `CircuitOpen`           — never retried; the breaker is already open.
/// - `Cancelled`             — never retried; the run is tearing down.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// Transient failure; the engine should re-try the job.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),

    /// The node's `timeout_ms` elapsed before it completed.
    #[error("node timed out: {0}")]
    Timeout(String),

    /// The node's circuit-breaker key was open at call time.
    #[error("circuit breaker open for key '{0}'")]
    CircuitOpen(String),

    /// A cancel signal was observed before or during the call.
    #[error("execution cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn name(&self) -> &'static str {
        match self {
            NodeError::Retryable(_) => "Retryable",
            NodeError::Fatal(_) => "Fatal",
            NodeError::Timeout(_) => "Timeout",
            NodeError::CircuitOpen(_) => "CircuitBreakerOpenError",
            NodeError::Cancelled => "Cancelled",
        }
    }
}
