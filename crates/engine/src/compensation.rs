//! Saga-style compensation: when a run fails partway through, completed
//! nodes that declared a `CompensationSpec` get a chance to run their
//! reverse action before the run is marked failed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use nodes::traits::ExecutionContext;
use nodes::NodeError;

use crate::cancel::CancelToken;
use crate::models::{CompensationSpec, Workflow};
use crate::registry::NodeRegistry;
use crate::retry::{execute_with_retry, BackoffStrategy, RetryHooks, RetryPolicy};
use crate::scheduler::{run_parallel, PredicateRegistry};

/// Ordering in which completed nodes' compensations run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompensationOrder {
    /// All compensable nodes run concurrently; their relative order is
    /// undefined.
    Parallel,
    /// Reverse completion order (undo the most recent effect first). The
    /// default — matches the usual saga pattern.
    #[default]
    Reverse,
    /// Same order the forward nodes completed in.
    Forward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationStatus {
    Succeeded,
    /// The node's `condition` predicate evaluated to `false`.
    Skipped,
    Failed,
}

#[derive(Debug, Clone)]
pub struct CompensationOutcome {
    pub node_id: String,
    pub status: CompensationStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompensationReport {
    pub outcomes: Vec<CompensationOutcome>,
}

impl CompensationReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status != CompensationStatus::Failed)
    }
}

/// Runs compensation for every node in `completed_nodes` (given in forward
/// completion order) that declared a `CompensationSpec`, in the order named
/// by `order` (falls back to the triggering node's own spec order, then
/// [`CompensationOrder::Reverse`] if neither is given).
///
/// `ctx_for` builds the `ExecutionContext` for a given compensating node id;
/// the compensation node is looked up in `registry` by `CompensationSpec::node_type`,
/// the same table forward nodes are resolved from.
#[allow(clippy::too_many_arguments)]
pub async fn compensate_run(
    wf: &Workflow,
    registry: &NodeRegistry,
    predicates: &PredicateRegistry,
    run_id: Uuid,
    completed_nodes: &[String],
    state: &Value,
    order: Option<CompensationOrder>,
    ctx_for: impl Fn(&str) -> ExecutionContext + Sync,
    cancel: &CancelToken,
) -> CompensationReport {
    let compensable: Vec<(&String, &CompensationSpec)> = completed_nodes
        .iter()
        .filter_map(|id| wf.nodes.get(id).and_then(|n| n.compensation.as_ref().map(|c| (id, c))))
        .collect();

    if compensable.is_empty() {
        return CompensationReport::default();
    }

    let order = order
        .or_else(|| compensable.last().map(|(_, spec)| spec.order))
        .unwrap_or_default();

    info!(%run_id, ?order, count = compensable.len(), "running compensation");

    match order {
        CompensationOrder::Forward => {
            let mut outcomes = Vec::with_capacity(compensable.len());
            for (id, spec) in compensable {
                outcomes.push(run_one(id, spec, registry, predicates, state, &ctx_for, cancel).await);
            }
            CompensationReport { outcomes }
        }
        CompensationOrder::Reverse => {
            let mut outcomes = Vec::with_capacity(compensable.len());
            for (id, spec) in compensable.into_iter().rev() {
                outcomes.push(run_one(id, spec, registry, predicates, state, &ctx_for, cancel).await);
            }
            CompensationReport { outcomes }
        }
        CompensationOrder::Parallel => {
            let concurrency = compensable.len().max(1);
            let tasks: Vec<_> = compensable
                .into_iter()
                .map(|(id, spec)| move || run_one(id, spec, registry, predicates, state, &ctx_for, cancel))
                .collect();
            let outcomes = run_parallel(tasks, concurrency).await;
            CompensationReport { outcomes }
        }
    }
}

async fn run_one(
    node_id: &str,
    spec: &CompensationSpec,
    registry: &NodeRegistry,
    predicates: &PredicateRegistry,
    state: &Value,
    ctx_for: &(impl Fn(&str) -> ExecutionContext + Sync),
    cancel: &CancelToken,
) -> CompensationOutcome {
    if let Some(condition) = &spec.condition {
        match predicates.loop_predicate(condition) {
            Some(p) if !p.should_loop(state) => {
                return CompensationOutcome { node_id: node_id.to_owned(), status: CompensationStatus::Skipped, error: None };
            }
            Some(_) => {}
            None => {
                warn!(node_id, condition, "compensation condition predicate not registered, running unconditionally");
            }
        }
    }

    let Some(node) = registry.get(&spec.node_type) else {
        return CompensationOutcome {
            node_id: node_id.to_owned(),
            status: CompensationStatus::Failed,
            error: Some(format!("no implementation registered for compensation node_type '{}'", spec.node_type)),
        };
    };

    let policy = RetryPolicy {
        strategy: BackoffStrategy::Constant,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(5),
        max_retries: spec.retries,
        jitter: 0.1,
        classifier: std::sync::Arc::new(|_: &NodeError| true),
    };

    let ctx = ctx_for(node_id);
    let call = || async {
        let fut = node.execute(state.clone(), &ctx);
        match spec.timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout(format!("compensation for '{node_id}' timed out after {ms}ms"))),
            },
            None => fut.await,
        }
    };

    let outcome = execute_with_retry(&policy, cancel, &RetryHooks::default(), |_| call()).await;

    match outcome.result {
        Ok(_) => CompensationOutcome { node_id: node_id.to_owned(), status: CompensationStatus::Succeeded, error: None },
        Err(err) => {
            warn!(node_id, %err, "compensation failed");
            CompensationOutcome { node_id: node_id.to_owned(), status: CompensationStatus::Failed, error: Some(err.to_string()) }
        }
    }
}
