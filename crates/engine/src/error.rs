//! Engine-level error types.

use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the workflow engine — validation, scheduling,
/// execution, and the ambient stores it coordinates.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Validation errors (§7: surfaced at build/register time) ------
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    #[error("edge references unknown node '{node_id}' ({side} side)")]
    UnknownNodeReference { node_id: String, side: &'static str },

    #[error("workflow graph contains a cycle outside declared loop edges")]
    CycleDetected,

    #[error("loop edge from '{from}' targets '{back_to}', which is not reachable from '{from}'")]
    UnreachableLoopTarget { from: String, back_to: String },

    #[error("edge predicate '{0}' is not registered")]
    UnknownPredicate(String),

    #[error("scheduler found pending nodes with no ready frontier: {0:?}")]
    CyclicOrUnreachableNodes(Vec<String>),

    // ------ Execution errors ------
    #[error("node '{node_id}' failed fatally: {message}")]
    NodeFatal { node_id: String, message: String },

    #[error("node '{node_id}' exceeded retry limit: {message}")]
    NodeRetryExhausted { node_id: String, message: String },

    #[error("no implementation registered for node_type '{0}'")]
    UnknownNodeType(String),

    #[error("no workflow registered under name '{0}'")]
    UnknownWorkflow(String),

    #[error("sub-workflow recursion exceeded max depth {max_depth}")]
    MaxDepthExceeded { max_depth: u32 },

    #[error("run {0} was cancelled")]
    Cancelled(Uuid),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} is already in a terminal state")]
    AlreadyTerminal(Uuid),

    // ------ DLQ / approval / checkpoint plumbing ------
    #[error("dead-letter entry {0} not found")]
    DlqEntryNotFound(Uuid),

    #[error("approval request {0} not found")]
    ApprovalRequestNotFound(Uuid),

    #[error("approval request {0} already resolved")]
    ApprovalAlreadyResolved(Uuid),

    #[error("checkpoint not found for run {0}")]
    CheckpointNotFound(Uuid),

    // ------ Infrastructure ------
    #[error("io error: {0}")]
    Io(String),

    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}
