//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow looks like in
//! memory and for the records the manager/executor produce while running
//! one. They serialise cleanly to JSON so they can be persisted behind
//! whichever store backs a given deployment (in-memory by default, the
//! `db` crate's Postgres tables optionally).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::compensation::CompensationOrder;
use crate::retry::RetryPolicy;

/// How a workflow's runs are started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerKind {
    /// Triggered by an incoming HTTP request to `/webhook/{path}`.
    Webhook { path: String },
    /// Triggered manually via the REST API or CLI.
    Manual,
    /// Triggered on a cron schedule.
    Cron { expression: String },
    /// Triggered by a named application event.
    Event { event_type: String },
}

/// What kind of work a node performs and the policies that govern it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Unique identifier within the workflow (referenced by edges).
    pub id: String,
    pub kind: NodeKind,
    pub retry_policy: Option<RetryPolicy>,
    pub circuit_breaker_key: Option<String>,
    pub circuit_breaker_config: Option<CircuitBreakerConfig>,
    pub timeout_ms: Option<u64>,
    /// Whether this node's result should be memoised by idempotency key.
    pub idempotent: bool,
    pub idempotency_ttl_ms: Option<u64>,
    pub compensation: Option<CompensationSpec>,
}

impl NodeSpec {
    pub fn function(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: NodeKind::Function { node_type: node_type.into() },
            retry_policy: None,
            circuit_breaker_key: None,
            circuit_breaker_config: None,
            timeout_ms: None,
            idempotent: false,
            idempotency_ttl_ms: None,
            compensation: None,
        }
    }

    pub fn is_human_gate(&self) -> bool {
        matches!(self.kind, NodeKind::HumanGate(_))
    }

    pub fn is_sub_workflow(&self) -> bool {
        matches!(self.kind, NodeKind::SubWorkflow(_))
    }
}

/// Tagged variant over the three shapes of work a node can perform. Matches
/// the "polymorphism over node kinds" design note: the executor switches on
/// this tag once, at the top of node dispatch, rather than branching on a
/// metadata flag scattered through the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    /// An ordinary node: looked up in the `NodeRegistry` by `node_type` and
    /// invoked as `state -> patch`.
    Function { node_type: String },
    /// Suspends the run pending an external decision.
    HumanGate(HumanGateSpec),
    /// Recurses into a nested workflow execution.
    SubWorkflow(SubWorkflowSpec),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    ApproveReject,
    MultiChoice,
    FreeForm,
    NumericRating,
    Chain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    Approve,
    Reject,
    Escalate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanGateSpec {
    pub approval_type: ApprovalKind,
    pub title: String,
    pub description: String,
    pub assignee: String,
    pub choices: Option<Vec<String>>,
    /// State key the resolved decision is written back under.
    pub decision_state_key: String,
    pub timeout_ms: Option<u64>,
    pub timeout_action: Option<TimeoutAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubWorkflowErrorStrategy {
    Propagate,
    Catch,
    Ignore,
    Retry { max_attempts: u32, delay_ms: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubWorkflowSpec {
    /// Name of the child `Workflow` to run, resolved via the manager's
    /// workflow registry.
    pub workflow_name: String,
    /// Key into the `MapperRegistry` used to build the child's initial
    /// state from the parent's current state.
    pub input_mapper: Option<String>,
    /// Key into the `MapperRegistry` used to merge the child's final state
    /// back into the parent's state.
    pub output_mapper: Option<String>,
    pub on_error: SubWorkflowErrorStrategy,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// Node type of the reverse action, looked up in the same
    /// `NodeRegistry` as forward nodes.
    pub node_type: String,
    /// Key into the `PredicateRegistry`; the compensation only runs if this
    /// evaluates truthy against the state at compensation time. `None`
    /// means always-run.
    pub condition: Option<String>,
    pub order: CompensationOrder,
    pub timeout_ms: Option<u64>,
    pub retries: u32,
}

/// A typed connector between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Edge {
    Sequential { from: String, to: String },
    Parallel { from: String, to: Vec<String> },
    /// `predicate` is a key into the `PredicateRegistry`; the predicate
    /// returns one or more node ids, which are only honoured if present in
    /// `targets`.
    Conditional {
        from: String,
        predicate: String,
        targets: Vec<String>,
    },
    /// The only backward edge kind. `predicate` decides whether control
    /// goes to `back_to` (true) or `exit_to` (false).
    Loop {
        from: String,
        predicate: String,
        back_to: String,
        exit_to: String,
    },
}

impl Edge {
    pub fn from_node(&self) -> &str {
        match self {
            Edge::Sequential { from, .. }
            | Edge::Parallel { from, .. }
            | Edge::Conditional { from, .. }
            | Edge::Loop { from, .. } => from,
        }
    }

    /// Static targets only — does not evaluate conditional/loop predicates.
    /// Used for dependency-graph construction, which only considers
    /// sequential edges and the forward part of parallel edges.
    pub fn static_forward_targets(&self) -> Vec<&str> {
        match self {
            Edge::Sequential { to, .. } => vec![to.as_str()],
            Edge::Parallel { to, .. } => to.iter().map(String::as_str).collect(),
            Edge::Conditional { .. } | Edge::Loop { .. } => Vec::new(),
        }
    }
}

/// An immutable workflow definition. Build one with
/// [`crate::builder::WorkflowBuilder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub trigger: TriggerKind,
    pub initial_state: serde_json::Value,
    pub nodes: IndexMap<String, NodeSpec>,
    pub edges: Vec<Edge>,
    pub max_concurrency: usize,
    pub max_sub_workflow_depth: u32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// RunRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

/// Mutable run state, owned by the manager; an executor holds a shared
/// handle to it for the duration of one execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub state: serde_json::Value,
    pub current_nodes: Vec<String>,
    pub completed_nodes: Vec<String>,
    pub failed_nodes: Vec<String>,
    pub priority: i32,
    pub scheduled_for: i64,
    pub tags: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<RunError>,
    pub parent_run_id: Option<Uuid>,
    pub parent_node_id: Option<String>,
    pub depth: u32,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(
        workflow_id: Uuid,
        workflow_name: impl Into<String>,
        state: serde_json::Value,
        priority: i32,
        scheduled_for: i64,
        tags: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow_id,
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            state,
            current_nodes: Vec::new(),
            completed_nodes: Vec::new(),
            failed_nodes: Vec::new(),
            priority,
            scheduled_for,
            tags,
            started_at: None,
            completed_at: None,
            error: None,
            parent_run_id: None,
            parent_node_id: None,
            depth: 0,
            created_at: now,
        }
    }
}

/// Filters accepted by `RunStore::list`/`count` and the manager's
/// `list_runs`.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub workflow_id: Option<Uuid>,
    pub workflow_name: Option<String>,
    pub status: Vec<RunStatus>,
    pub tags: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunStats {
    pub total: u64,
    pub by_status: HashMap<String, u64>,
    /// Average `completed_at - started_at` across completed runs only, in
    /// milliseconds. `None` if there are no completed runs.
    pub avg_completed_duration_ms: Option<f64>,
}
