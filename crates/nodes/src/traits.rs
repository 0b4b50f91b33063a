//! The `ExecutableNode` trait — the contract every node must fulfil.

use async_trait::async_trait;
use serde_json::Value;

use crate::NodeError;

/// Shared context passed to every node during execution.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the parent workflow.
    pub workflow_id: uuid::Uuid,
    /// ID of the current run.
    pub run_id: uuid::Uuid,
    /// ID of the node currently executing.
    pub node_id: String,
    /// How many times this node has previously executed within this run
    /// (only nonzero across loop-edge iterations; retry attempts are not
    /// counted here — they never observe a positive value).
    pub iteration: u32,
    /// Decrypted secrets scoped to this workflow.
    pub secrets: std::collections::HashMap<String, String>,
}

/// The core node trait: `state -> patch`.
///
/// All built-in nodes and plugins must implement this. `execute` receives
/// the run's current state and returns a patch that the executor merges
/// shallowly (key-overwrite, arrays replaced wholesale) back into it.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    async fn execute(&self, state: Value, ctx: &ExecutionContext) -> Result<Value, NodeError>;
}
