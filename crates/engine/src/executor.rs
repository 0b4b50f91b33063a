//! The state machine that drives one run to completion, pause, or
//! cancellation.
//!
//! Each tick computes the current frontier (the static sequential/parallel
//! dependency graph plus whatever a conditional/loop edge has dynamically
//! queued), dispatches it through [`scheduler::run_parallel`] bounded by the
//! workflow's `max_concurrency`, merges results back into state, checkpoints,
//! and routes to the next frontier. A node's `NodeKind` decides how it's
//! dispatched: `Function` goes through circuit-breaker admission,
//! idempotency memoisation, and retry/timeout; `HumanGate` suspends the run
//! on an `ApprovalStore` request; `SubWorkflow` recurses via a manager-
//! supplied child runner. On terminal failure, completed compensable nodes
//! are unwound in Saga order and the failure is parked on the DLQ.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{error, instrument, warn};
use uuid::Uuid;

use nodes::traits::ExecutionContext;
use nodes::{ExecutableNode, NodeError};

use crate::approval::{await_response_or_timeout, ApprovalRequest, ApprovalStore, Decision};
use crate::cancel::CancelToken;
use crate::checkpoint::{CheckpointKey, CheckpointSnapshot, CheckpointStore};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitCallError};
use crate::compensation::compensate_run;
use crate::dlq::{DeadLetterQueue, DlqEntry, DlqErrorInfo, DlqFilter};
use crate::error::EngineError;
use crate::idempotency::{compute_key, idempotent, IdempotencyStore};
use crate::models::{
    Edge, HumanGateSpec, NodeKind, NodeSpec, RunError, RunRecord, RunStatus, SubWorkflowSpec, Workflow,
};
use crate::registry::{MapperRegistry, NodeRegistry};
use crate::retry::{execute_with_retry, RetryHooks};
use crate::run_store::SharedRunStore;
use crate::scheduler::{build_dependency_graph, get_ready_nodes, run_parallel, PredicateRegistry};
use crate::subworkflow::execute_subworkflow;

/// What a sub-workflow node asks the manager to spawn. Built here and
/// handed to a manager-supplied [`ChildRunner`] so this module never
/// depends on `manager` directly — symmetric with how `subworkflow.rs`
/// takes a generic `run_child` closure instead of calling back into
/// `executor`.
#[derive(Clone)]
pub struct ChildSpawnArgs {
    pub workflow_name: String,
    pub input: Value,
    pub depth: u32,
    pub parent_run_id: Uuid,
    pub parent_node_id: String,
}

pub type ChildRunner = Arc<dyn Fn(ChildSpawnArgs) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>;

/// Process-wide services the manager owns and shares by reference across
/// every executor it spawns.
pub struct ExecutorServices {
    pub node_registry: Arc<NodeRegistry>,
    pub mapper_registry: Arc<MapperRegistry>,
    pub predicates: Arc<PredicateRegistry>,
    pub circuit_breakers: Arc<CircuitBreakerRegistry>,
    pub idempotency: Arc<IdempotencyStore>,
    pub dlq: Arc<dyn DeadLetterQueue>,
    pub approvals: Arc<ApprovalStore>,
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub run_store: SharedRunStore,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed(Value),
    Paused,
    Cancelled,
    Failed(EngineError),
}

/// Runs exactly one [`RunRecord`] to completion, pause, or cancellation. The
/// manager constructs a fresh instance per dispatched run, and recursively
/// for every sub-workflow child (via `ChildRunner`).
pub struct WorkflowExecutor {
    services: Arc<ExecutorServices>,
    cancel: CancelToken,
    paused: Arc<AtomicBool>,
    child_runner: ChildRunner,
}

impl WorkflowExecutor {
    pub fn new(services: Arc<ExecutorServices>, cancel: CancelToken, paused: Arc<AtomicBool>, child_runner: ChildRunner) -> Self {
        Self { services, cancel, paused, child_runner }
    }

    #[instrument(skip(self, wf, run), fields(run_id = %run.id, workflow = %wf.name))]
    pub async fn run(&self, wf: &Workflow, run: &mut RunRecord) -> RunOutcome {
        let ckpt_key = checkpoint_key(run);
        let mut completed: HashSet<String> = run.completed_nodes.iter().cloned().collect();
        let mut state = run.state.clone();
        let mut execution_order: Vec<String> = run.completed_nodes.clone();

        if let Ok(Some(snapshot)) = self.services.checkpoints.get(&ckpt_key).await {
            if !snapshot.terminal {
                completed = snapshot.completed_nodes.iter().cloned().collect();
                state = snapshot.state;
                execution_order = snapshot.execution_order;
            }
        }

        if run.started_at.is_none() {
            run.started_at = Some(Utc::now());
        }
        let _ = self
            .services
            .run_store
            .update(run.id, Box::new(|r| r.status = RunStatus::Running))
            .await;

        let graph = build_dependency_graph(wf);
        let predicate_targets = predicate_target_nodes(wf);
        let mut iteration_counts: HashMap<String, u32> = HashMap::new();
        let mut dynamic_queue: VecDeque<String> = VecDeque::new();

        loop {
            if self.cancel.is_cancelled() {
                self.checkpoint(run, &state, &completed, &execution_order, false).await;
                let _ = self
                    .services
                    .run_store
                    .update(
                        run.id,
                        Box::new(|r| {
                            r.status = RunStatus::Cancelled;
                            r.completed_at = Some(Utc::now());
                        }),
                    )
                    .await;
                return RunOutcome::Cancelled;
            }
            if self.paused.load(Ordering::Acquire) {
                self.checkpoint(run, &state, &completed, &execution_order, false).await;
                let _ = self
                    .services
                    .run_store
                    .update(run.id, Box::new(|r| r.status = RunStatus::Paused))
                    .await;
                return RunOutcome::Paused;
            }

            let non_predicate_pending: HashSet<String> = wf
                .nodes
                .keys()
                .filter(|k| !completed.contains(k.as_str()) && !predicate_targets.contains(k.as_str()))
                .cloned()
                .collect();
            let mut wave: Vec<String> =
                get_ready_nodes(&graph, &completed, &non_predicate_pending).into_iter().map(String::from).collect();
            while let Some(n) = dynamic_queue.pop_front() {
                if !completed.contains(&n) && !wave.contains(&n) {
                    wave.push(n);
                }
            }
            if wave.is_empty() {
                break;
            }
            wave.sort();

            let run_id = run.id;
            let depth = run.depth;
            let tasks: Vec<_> = wave
                .iter()
                .map(|node_id| {
                    let node_id = node_id.clone();
                    let state = state.clone();
                    let iteration = iteration_counts.get(&node_id).copied().unwrap_or(0);
                    move || self.execute_node(wf, run_id, depth, node_id, state, iteration)
                })
                .collect();
            let results = run_parallel(tasks, wf.max_concurrency).await;

            for (node_id, result) in wave.iter().zip(results) {
                match result {
                    Ok(outcome) => {
                        match outcome {
                            NodeOutcome::Patch(patch) => merge_patch(&mut state, &patch),
                            NodeOutcome::Replace(v) => state = v,
                        }
                        completed.insert(node_id.clone());
                        execution_order.push(node_id.clone());
                    }
                    Err(err) => {
                        return self.handle_failure(wf, run, &execution_order, &state, node_id, err).await;
                    }
                }
            }

            // Sequential/Parallel routing is already handled by the static
            // dependency-graph sweep above (`get_ready_nodes`), which waits
            // for every predecessor of a fan-in join. Only Conditional and
            // Loop edges are evaluated here, since they're routing
            // decisions rather than join dependencies — folding their
            // targets into the same sweep would let a join node fire as
            // soon as any one branch finished instead of all of them.
            for node_id in &wave {
                for edge in &wf.edges {
                    if edge.from_node() != node_id {
                        continue;
                    }
                    match edge {
                        Edge::Sequential { .. } | Edge::Parallel { .. } => {}
                        Edge::Conditional { predicate, targets, .. } => {
                            let chosen = self.services.predicates.conditional_predicate(predicate).map(|p| p.targets(&state));
                            match chosen {
                                Some(candidates) => {
                                    for candidate in candidates {
                                        if targets.contains(&candidate)
                                            && !completed.contains(&candidate)
                                            && !dynamic_queue.contains(&candidate)
                                        {
                                            dynamic_queue.push_back(candidate);
                                        }
                                    }
                                }
                                None => {
                                    let e = EngineError::UnknownPredicate(predicate.clone());
                                    return self.handle_failure(wf, run, &execution_order, &state, node_id, e).await;
                                }
                            }
                        }
                        Edge::Loop { predicate, back_to, exit_to, .. } => {
                            let should_loop = match self.services.predicates.loop_predicate(predicate) {
                                Some(p) => p.should_loop(&state),
                                None => {
                                    let e = EngineError::UnknownPredicate(predicate.clone());
                                    return self.handle_failure(wf, run, &execution_order, &state, node_id, e).await;
                                }
                            };
                            if should_loop {
                                let body = loop_body(wf, node_id, back_to);
                                for n in &body {
                                    completed.remove(n);
                                    *iteration_counts.entry(n.clone()).or_insert(0) += 1;
                                }
                            }
                            let target = if should_loop { back_to } else { exit_to };
                            if !completed.contains(target) && !dynamic_queue.contains(target) {
                                dynamic_queue.push_back(target.clone());
                            }
                        }
                    }
                }
            }

            run.state = state.clone();
            run.completed_nodes = completed.iter().cloned().collect();
            self.checkpoint(run, &state, &completed, &execution_order, false).await;
        }

        self.checkpoint(run, &state, &completed, &execution_order, true).await;
        let final_state = state.clone();
        let _ = self
            .services
            .run_store
            .update(
                run.id,
                Box::new(move |r| {
                    r.status = RunStatus::Completed;
                    r.completed_at = Some(Utc::now());
                    r.state = state;
                    r.current_nodes.clear();
                }),
            )
            .await;
        RunOutcome::Completed(final_state)
    }

    async fn execute_node(&self, wf: &Workflow, run_id: Uuid, depth: u32, node_id: String, state: Value, iteration: u32) -> Result<NodeOutcome, EngineError> {
        let spec = wf
            .nodes
            .get(&node_id)
            .ok_or_else(|| EngineError::UnknownNodeReference { node_id: node_id.clone(), side: "from" })?;

        match &spec.kind {
            NodeKind::Function { node_type } => self
                .run_function_node(wf, run_id, &node_id, spec, node_type, state, iteration)
                .await
                .map(NodeOutcome::Patch),
            NodeKind::HumanGate(gate) => self.run_human_gate(wf, run_id, &node_id, gate).await.map(NodeOutcome::Patch),
            NodeKind::SubWorkflow(sw) => self
                .run_subworkflow_node(run_id, depth, &node_id, sw, &state)
                .await
                .map(NodeOutcome::Replace),
        }
    }

    async fn call_node_once(
        &self,
        node: &Arc<dyn ExecutableNode>,
        cb_key: Option<&str>,
        timeout_ms: Option<u64>,
        state: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError> {
        let call = || async {
            let fut = node.execute(state.clone(), ctx);
            match timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), fut).await {
                    Ok(result) => result,
                    Err(_) => Err(NodeError::Timeout(format!("node '{}' timed out after {ms}ms", ctx.node_id))),
                },
                None => fut.await,
            }
        };

        match cb_key {
            Some(key) => match self.services.circuit_breakers.execute(key, call).await {
                Ok(v) => Ok(v),
                Err(CircuitCallError::Open(e)) => Err(NodeError::CircuitOpen(e.0)),
                Err(CircuitCallError::Inner(e)) => Err(e),
            },
            None => call().await,
        }
    }

    async fn run_function_node(
        &self,
        wf: &Workflow,
        run_id: Uuid,
        node_id: &str,
        spec: &NodeSpec,
        node_type: &str,
        state: Value,
        iteration: u32,
    ) -> Result<Value, EngineError> {
        let node = self
            .services
            .node_registry
            .get(node_type)
            .cloned()
            .ok_or_else(|| EngineError::UnknownNodeType(node_type.to_owned()))?;

        if let (Some(key), Some(cfg)) = (&spec.circuit_breaker_key, spec.circuit_breaker_config) {
            self.services.circuit_breakers.configure(key, cfg);
        }

        let ctx = ExecutionContext {
            workflow_id: wf.id,
            run_id,
            node_id: node_id.to_owned(),
            iteration,
            secrets: HashMap::new(),
        };

        let policy = spec.retry_policy.clone().unwrap_or_default();
        let cb_key = spec.circuit_breaker_key.as_deref();
        let timeout_ms = spec.timeout_ms;

        let run_with_retry = || async {
            execute_with_retry(&policy, &self.cancel, &RetryHooks::default(), |_attempt| {
                self.call_node_once(&node, cb_key, timeout_ms, state.clone(), &ctx)
            })
            .await
            .result
        };

        let result = if spec.idempotent {
            let key = compute_key(&wf.name, node_id, &state);
            let ttl = spec.idempotency_ttl_ms.map(Duration::from_millis).unwrap_or(Duration::from_secs(3600));
            idempotent(&self.services.idempotency, &key, ttl, run_with_retry).await
        } else {
            run_with_retry().await
        };

        result.map_err(|e| map_node_error(run_id, node_id, e))
    }

    async fn run_human_gate(&self, wf: &Workflow, run_id: Uuid, node_id: &str, gate: &HumanGateSpec) -> Result<Value, EngineError> {
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            workflow_id: wf.id,
            run_id,
            node_id: node_id.to_owned(),
            kind: gate.approval_type.clone(),
            title: gate.title.clone(),
            description: gate.description.clone(),
            assignee: gate.assignee.clone(),
            choices: gate.choices.clone(),
            chain: None,
            created_at: Utc::now(),
            timeout_ms: gate.timeout_ms,
            timeout_action: gate.timeout_action.clone(),
        };
        let request_id = self.services.approvals.create_request(request);

        let _ = self.services.run_store.update(run_id, Box::new(|r| r.status = RunStatus::Paused)).await;
        let response = await_response_or_timeout(&self.services.approvals, request_id, gate.timeout_ms, gate.timeout_action.clone()).await;
        let _ = self.services.run_store.update(run_id, Box::new(|r| r.status = RunStatus::Running)).await;

        let decision_value = match response.decision {
            Decision::Bool(b) => Value::Bool(b),
            Decision::Text(s) => Value::String(s),
            Decision::Number(n) => serde_json::json!(n),
            Decision::Null => Value::Null,
        };
        let mut patch = serde_json::Map::new();
        patch.insert(gate.decision_state_key.clone(), decision_value);
        Ok(Value::Object(patch))
    }

    async fn run_subworkflow_node(&self, run_id: Uuid, depth: u32, node_id: &str, spec: &SubWorkflowSpec, state: &Value) -> Result<Value, EngineError> {
        let child_runner = self.child_runner.clone();
        let workflow_name = spec.workflow_name.clone();
        let parent_run_id = run_id;
        let node_id_owned = node_id.to_owned();

        let run_child = move |input: Value| {
            let child_runner = child_runner.clone();
            let workflow_name = workflow_name.clone();
            let node_id_owned = node_id_owned.clone();
            async move {
                (child_runner)(ChildSpawnArgs {
                    workflow_name,
                    input,
                    depth: depth + 1,
                    parent_run_id,
                    parent_node_id: node_id_owned,
                })
                .await
            }
        };

        // The manager refuses to hand out a ChildRunner for a recursion that
        // would exceed the parent workflow's configured max_sub_workflow_depth;
        // execute_subworkflow's own depth check exists for direct callers
        // (e.g. tests) that construct a WorkflowExecutor by hand, so an
        // effectively-unbounded ceiling here doesn't skip that enforcement.
        execute_subworkflow(
            &spec.input_mapper,
            &spec.output_mapper,
            &spec.on_error,
            &self.services.mapper_registry,
            state,
            depth,
            u32::MAX,
            &self.cancel,
            run_child,
        )
        .await
    }

    async fn checkpoint(&self, run: &RunRecord, state: &Value, completed: &HashSet<String>, execution_order: &[String], terminal: bool) {
        let key = checkpoint_key(run);
        let snapshot = CheckpointSnapshot {
            run_id: run.id,
            state: state.clone(),
            completed_nodes: completed.iter().cloned().collect(),
            execution_order: execution_order.to_vec(),
            terminal,
        };
        if let Err(e) = self.services.checkpoints.put(key, snapshot).await {
            warn!(run_id = %run.id, error = %e, "failed to write checkpoint");
        }
    }

    async fn handle_failure(
        &self,
        wf: &Workflow,
        run: &mut RunRecord,
        execution_order: &[String],
        state: &Value,
        node_id: &str,
        err: EngineError,
    ) -> RunOutcome {
        error!(run_id = %run.id, node_id, %err, "node failed, starting compensation");

        let ctx_for = |nid: &str| ExecutionContext {
            workflow_id: wf.id,
            run_id: run.id,
            node_id: nid.to_owned(),
            iteration: 0,
            secrets: HashMap::new(),
        };
        let report = compensate_run(
            wf,
            &self.services.node_registry,
            &self.services.predicates,
            run.id,
            execution_order,
            state,
            None,
            ctx_for,
            &self.cancel,
        )
        .await;
        if !report.all_succeeded() {
            warn!(run_id = %run.id, "one or more compensations failed");
        }

        let max_attempts = wf.nodes.get(node_id).and_then(|n| n.retry_policy.as_ref()).map(|p| p.max_retries + 1).unwrap_or(1);
        let entry = DlqEntry {
            id: Uuid::new_v4(),
            workflow_id: wf.id,
            workflow_name: wf.name.clone(),
            node_id: node_id.to_owned(),
            state: state.clone(),
            input: state.clone(),
            error: DlqErrorInfo { name: "EngineError".into(), message: err.to_string(), stack: None },
            attempts: max_attempts,
            max_attempts,
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(7),
            tags: run.tags.clone(),
            metadata: serde_json::json!({}),
            last_attempt: Some(Utc::now()),
        };
        if let Err(e) = self.services.dlq.add(entry).await {
            error!(run_id = %run.id, error = %e, "failed to write dead-letter entry");
        }

        let completed: HashSet<String> = execution_order.iter().cloned().collect();
        self.checkpoint(run, state, &completed, execution_order, true).await;

        let run_error = RunError { name: "EngineError".into(), message: err.to_string(), stack: None };
        let failed_node = node_id.to_owned();
        let _ = self
            .services
            .run_store
            .update(
                run.id,
                Box::new(move |r| {
                    r.status = RunStatus::Failed;
                    r.completed_at = Some(Utc::now());
                    r.error = Some(run_error);
                    r.failed_nodes.push(failed_node);
                }),
            )
            .await;

        RunOutcome::Failed(err)
    }
}

enum NodeOutcome {
    /// A shallow patch merged into the run's state (ordinary function nodes
    /// and human gates, whose decision is written under one state key).
    Patch(Value),
    /// The run's entire state is replaced (sub-workflow nodes, whose
    /// input/output mappers already decide exactly what crosses the
    /// parent/child boundary).
    Replace(Value),
}

fn merge_patch(state: &mut Value, patch: &Value) {
    match (state.as_object_mut(), patch.as_object()) {
        (Some(state_obj), Some(patch_obj)) => {
            for (k, v) in patch_obj {
                state_obj.insert(k.clone(), v.clone());
            }
        }
        _ if !patch.is_null() => *state = patch.clone(),
        _ => {}
    }
}

fn checkpoint_key(run: &RunRecord) -> CheckpointKey {
    match (run.parent_run_id, &run.parent_node_id) {
        (Some(parent_id), Some(parent_node_id)) => CheckpointKey::child(run.id, parent_id, parent_node_id.clone()),
        _ => CheckpointKey::top_level(run.id),
    }
}

fn map_node_error(run_id: Uuid, node_id: &str, err: NodeError) -> EngineError {
    match err {
        NodeError::Cancelled => EngineError::Cancelled(run_id),
        NodeError::Fatal(message) => EngineError::NodeFatal { node_id: node_id.to_owned(), message },
        NodeError::Retryable(message) | NodeError::Timeout(message) => {
            EngineError::NodeRetryExhausted { node_id: node_id.to_owned(), message }
        }
        NodeError::CircuitOpen(key) => {
            EngineError::NodeFatal { node_id: node_id.to_owned(), message: format!("circuit breaker open for key '{key}'") }
        }
    }
}

/// Every node that is only reachable via a `Conditional`/`Loop` edge. These
/// default to an empty dependency set in the static graph (nothing declares
/// them a sequential/parallel target), which would otherwise make them look
/// "ready" from the very first tick; excluding them from the static sweep
/// means they only ever enter the frontier once their triggering edge fires.
fn predicate_target_nodes(wf: &Workflow) -> HashSet<String> {
    let mut set = HashSet::new();
    for edge in &wf.edges {
        let from = edge.from_node();
        match edge {
            // A target equal to the edge's own source is the common
            // "re-run this node" loop shape (`back_to == from`). That node
            // must still be reachable via the static sweep for its first
            // run; only the re-entry is routed dynamically, handled by
            // `loop_body` re-opening `completed` on each iteration.
            Edge::Conditional { targets, .. } => {
                set.extend(targets.iter().filter(|t| t.as_str() != from).cloned())
            }
            Edge::Loop { back_to, exit_to, .. } => {
                if back_to != from {
                    set.insert(back_to.clone());
                }
                if exit_to != from {
                    set.insert(exit_to.clone());
                }
            }
            Edge::Sequential { .. } | Edge::Parallel { .. } => {}
        }
    }
    set
}

/// Nodes reachable forward from `back_to` up to and including `from`,
/// following sequential/parallel/conditional-target edges (never loop
/// edges, to avoid walking into an unrelated nested loop). Un-completing
/// this set lets a loop body re-execute on its next iteration.
fn loop_body(wf: &Workflow, from: &str, back_to: &str) -> HashSet<String> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &wf.edges {
        match edge {
            Edge::Sequential { from: f, to } => adj.entry(f.as_str()).or_default().push(to.as_str()),
            Edge::Parallel { from: f, to } => {
                for t in to {
                    adj.entry(f.as_str()).or_default().push(t.as_str());
                }
            }
            Edge::Conditional { from: f, targets, .. } => {
                for t in targets {
                    adj.entry(f.as_str()).or_default().push(t.as_str());
                }
            }
            Edge::Loop { .. } => {}
        }
    }

    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    visited.insert(back_to.to_owned());
    queue.push_back(back_to);
    while let Some(n) = queue.pop_front() {
        if n == from {
            continue;
        }
        if let Some(next) = adj.get(n) {
            for &t in next {
                if visited.insert(t.to_owned()) {
                    queue.push_back(t);
                }
            }
        }
    }
    visited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::dlq::InMemoryDlq;
    use crate::models::{CompensationSpec, NodeSpec, SubWorkflowErrorStrategy};
    use crate::run_store::InMemoryRunStore;
    use crate::scheduler::LoopPredicate;
    use nodes::mock::MockNode;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn services_with(registry: NodeRegistry, predicates: PredicateRegistry) -> Arc<ExecutorServices> {
        Arc::new(ExecutorServices {
            node_registry: Arc::new(registry),
            mapper_registry: Arc::new(MapperRegistry::new()),
            predicates: Arc::new(predicates),
            circuit_breakers: Arc::new(CircuitBreakerRegistry::new(Default::default())),
            idempotency: Arc::new(IdempotencyStore::new()),
            dlq: Arc::new(InMemoryDlq::new()),
            approvals: Arc::new(ApprovalStore::new()),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            run_store: Arc::new(InMemoryRunStore::new()),
        })
    }

    fn no_op_child_runner() -> ChildRunner {
        Arc::new(|_args| Box::pin(async { Ok(Value::Null) }))
    }

    fn executor_for(services: Arc<ExecutorServices>) -> WorkflowExecutor {
        WorkflowExecutor::new(services, CancelToken::new(), Arc::new(AtomicBool::new(false)), no_op_child_runner())
    }

    fn new_run(wf: &Workflow) -> RunRecord {
        RunRecord::new(wf.id, wf.name.clone(), wf.initial_state.clone(), 0, 0, vec![])
    }

    #[tokio::test]
    async fn linear_workflow_runs_to_completion() {
        let wf = WorkflowBuilder::new("linear")
            .initial_state(json!({}))
            .add_node(NodeSpec::function("a", "mock"))
            .add_node(NodeSpec::function("b", "mock"))
            .add_sequential("a", "b")
            .build()
            .unwrap();

        let mut registry = NodeRegistry::new();
        registry.insert("mock".into(), Arc::new(MockNode::returning("mock", json!({"touched": true}))));
        let services = services_with(registry, PredicateRegistry::new());
        let executor = executor_for(services);

        let mut run = new_run(&wf);
        let outcome = executor.run(&wf, &mut run).await;
        match outcome {
            RunOutcome::Completed(state) => assert_eq!(state["touched"], json!(true)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fan_out_fan_in_waits_for_both_branches() {
        let wf = WorkflowBuilder::new("diamond")
            .initial_state(json!({}))
            .add_node(NodeSpec::function("a", "mock"))
            .add_node(NodeSpec::function("b", "mock"))
            .add_node(NodeSpec::function("c", "mock"))
            .add_node(NodeSpec::function("d", "mock"))
            .add_parallel("a", vec!["b".into(), "c".into()])
            .add_sequential("b", "d")
            .add_sequential("c", "d")
            .build()
            .unwrap();

        let mut registry = NodeRegistry::new();
        registry.insert("mock".into(), Arc::new(MockNode::returning("mock", json!({}))));
        let services = services_with(registry, PredicateRegistry::new());
        let executor = executor_for(services);

        let mut run = new_run(&wf);
        let outcome = executor.run(&wf, &mut run).await;
        assert!(matches!(outcome, RunOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn retry_then_succeed_eventually_completes() {
        let wf = WorkflowBuilder::new("flaky")
            .initial_state(json!({}))
            .add_node(NodeSpec::function("a", "flaky"))
            .build()
            .unwrap();

        let mut registry = NodeRegistry::new();
        registry.insert("flaky".into(), Arc::new(MockNode::failing_then_succeeding("flaky", 2, json!({"ok": true}))));
        let services = services_with(registry, PredicateRegistry::new());
        let executor = executor_for(services);

        let mut run = new_run(&wf);
        let outcome = executor.run(&wf, &mut run).await;
        match outcome {
            RunOutcome::Completed(state) => assert_eq!(state["ok"], json!(true)),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fatal_node_triggers_compensation_and_dlq() {
        let mut charge = NodeSpec::function("charge", "charge");
        charge.compensation = Some(CompensationSpec {
            node_type: "refund".into(),
            condition: None,
            order: crate::compensation::CompensationOrder::Reverse,
            timeout_ms: None,
            retries: 0,
        });
        let wf = WorkflowBuilder::new("saga")
            .initial_state(json!({}))
            .add_node(charge)
            .add_node(NodeSpec::function("ship", "ship"))
            .add_sequential("charge", "ship")
            .build()
            .unwrap();

        let mut registry = NodeRegistry::new();
        registry.insert("charge".into(), Arc::new(MockNode::returning("charge", json!({}))));
        registry.insert("ship".into(), Arc::new(MockNode::failing_fatal("ship", "warehouse offline")));
        registry.insert("refund".into(), Arc::new(MockNode::returning("refund", json!({"refunded": true}))));
        let services = services_with(registry, PredicateRegistry::new());
        let dlq = services.dlq.clone();
        let executor = executor_for(services);

        let mut run = new_run(&wf);
        let outcome = executor.run(&wf, &mut run).await;
        assert!(matches!(outcome, RunOutcome::Failed(_)));

        let entries = dlq.list(&DlqFilter::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node_id, "ship");
    }

    struct OnceTrue {
        fired: AtomicUsize,
    }
    impl LoopPredicate for OnceTrue {
        fn should_loop(&self, _state: &Value) -> bool {
            self.fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0
        }
    }

    #[tokio::test]
    async fn loop_edge_reexecutes_body_until_predicate_exits() {
        let wf = WorkflowBuilder::new("loopy")
            .initial_state(json!({}))
            .add_node(NodeSpec::function("step", "mock"))
            .add_node(NodeSpec::function("done", "mock"))
            .add_loop("step", "keep_going", "step", "done")
            .build()
            .unwrap();

        let mut registry = NodeRegistry::new();
        registry.insert("mock".into(), Arc::new(MockNode::returning("mock", json!({}))));
        let mut predicates = PredicateRegistry::new();
        predicates.register_loop("keep_going", Arc::new(OnceTrue { fired: AtomicUsize::new(0) }));
        let services = services_with(registry, predicates);
        let executor = executor_for(services);

        let mut run = new_run(&wf);
        let outcome = executor.run(&wf, &mut run).await;
        assert!(matches!(outcome, RunOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn idempotent_node_is_not_invoked_twice_for_the_same_key() {
        let wf = WorkflowBuilder::new("idem")
            .initial_state(json!({}))
            .add_node({
                let mut n = NodeSpec::function("charge", "mock");
                n.idempotent = true;
                n
            })
            .build()
            .unwrap();

        let mut registry = NodeRegistry::new();
        registry.insert("mock".into(), Arc::new(MockNode::returning("mock", json!({"charged": true}))));
        let services = services_with(registry, PredicateRegistry::new());
        let idempotency = services.idempotency.clone();
        let executor = executor_for(services);

        let mut run = new_run(&wf);
        let outcome = executor.run(&wf, &mut run).await;
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(idempotency.len(), 1);
    }

    #[tokio::test]
    async fn subworkflow_propagate_bubbles_child_failure() {
        let wf = WorkflowBuilder::new("parent")
            .initial_state(json!({}))
            .add_node(NodeSpec {
                id: "spawn".into(),
                kind: NodeKind::SubWorkflow(SubWorkflowSpec {
                    workflow_name: "child".into(),
                    input_mapper: None,
                    output_mapper: None,
                    on_error: SubWorkflowErrorStrategy::Propagate,
                    timeout_ms: None,
                }),
                retry_policy: None,
                circuit_breaker_key: None,
                circuit_breaker_config: None,
                timeout_ms: None,
                idempotent: false,
                idempotency_ttl_ms: None,
                compensation: None,
            })
            .build()
            .unwrap();

        let services = services_with(NodeRegistry::new(), PredicateRegistry::new());
        let failing_runner: ChildRunner =
            Arc::new(|_args| Box::pin(async { Err(EngineError::NodeFatal { node_id: "child".into(), message: "boom".into() }) }));
        let executor = WorkflowExecutor::new(services, CancelToken::new(), Arc::new(AtomicBool::new(false)), failing_runner);

        let mut run = new_run(&wf);
        let outcome = executor.run(&wf, &mut run).await;
        assert!(matches!(outcome, RunOutcome::Failed(_)));
    }
}
