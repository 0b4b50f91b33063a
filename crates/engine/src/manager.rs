//! The manager: accepts workflow definitions, creates runs, enqueues them
//! on the priority queue, and dispatches up to a concurrency cap. Owns
//! every process-wide registry (circuit breakers, idempotency store, DLQ,
//! approval store, checkpoints, run store) and hands shared references to
//! each [`WorkflowExecutor`] it spawns — including, recursively, the
//! executors it spawns for sub-workflow children via [`ChildRunner`].
//!
//! Implements [`triggers::FireSink`] so the trigger dispatcher (cron,
//! webhook, event) can create runs without depending on the engine crate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use queue::{PriorityQueue, QueueEntry};
use triggers::{FireContext, FireSink, TriggerError};

use crate::approval::ApprovalStore;
use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::dlq::{DeadLetterQueue, InMemoryDlq};
use crate::error::EngineError;
use crate::executor::{ChildRunner, ChildSpawnArgs, ExecutorServices, RunOutcome, WorkflowExecutor};
use crate::idempotency::IdempotencyStore;
use crate::models::{RunFilter, RunRecord, RunStats, RunStatus, Workflow};
use crate::registry::{MapperRegistry, NodeRegistry};
use crate::run_store::{InMemoryRunStore, RunStore, SharedRunStore};
use crate::scheduler::PredicateRegistry;

/// Tuning knobs the manager is constructed with.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub default_circuit_breaker: CircuitBreakerConfig,
    pub max_sub_workflow_depth: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            poll_interval: Duration::from_millis(10),
            default_circuit_breaker: CircuitBreakerConfig::default(),
            max_sub_workflow_depth: 10,
        }
    }
}

/// Options accepted by [`Manager::schedule`].
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub at: Option<i64>,
    pub priority: Option<i32>,
    pub tags: Vec<String>,
    pub state_patch: Option<Value>,
}

/// A callback fired after every run-record mutation, with a copy of the
/// resulting record. Registered via [`Manager::on_run_state_change`].
pub type RunObserver = Arc<dyn Fn(&RunRecord) + Send + Sync>;

struct RunHandle {
    cancel: crate::cancel::CancelToken,
    paused: Arc<AtomicBool>,
}

/// Accepts workflow definitions, creates runs, enqueues them on the
/// priority queue, and dispatches up to `max_concurrency` concurrently
/// executing runs. The single owner of every process-wide service the
/// executor needs; executors borrow them by `Arc` for the lifetime of one
/// dispatch.
pub struct Manager {
    config: ManagerConfig,
    workflows: dashmap::DashMap<String, Arc<Workflow>>,
    queue: Arc<PriorityQueue>,
    services: Arc<ExecutorServices>,
    active: Arc<AtomicUsize>,
    in_flight: dashmap::DashMap<Uuid, RunHandle>,
    observers: parking_lot::Mutex<Vec<RunObserver>>,
    stop_tx: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    dispatch_handle: AsyncMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Manager {
    pub fn new(config: ManagerConfig, node_registry: NodeRegistry, mapper_registry: MapperRegistry, predicates: PredicateRegistry) -> Arc<Self> {
        Self::with_services(
            config.clone(),
            Arc::new(ExecutorServices {
                node_registry: Arc::new(node_registry),
                mapper_registry: Arc::new(mapper_registry),
                predicates: Arc::new(predicates),
                circuit_breakers: Arc::new(CircuitBreakerRegistry::new(config.default_circuit_breaker)),
                idempotency: Arc::new(IdempotencyStore::new()),
                dlq: Arc::new(InMemoryDlq::new()) as Arc<dyn DeadLetterQueue>,
                approvals: Arc::new(ApprovalStore::new()),
                checkpoints: Arc::new(InMemoryCheckpointStore::new()) as Arc<dyn CheckpointStore>,
                run_store: Arc::new(InMemoryRunStore::new()) as SharedRunStore,
            }),
        )
    }

    /// Construct with caller-supplied service implementations — e.g. a
    /// `FileDlq`/`FileCheckpointStore` pair, or the Postgres-backed
    /// `RunStore` from `db::repository::runs` wrapped behind the
    /// `engine::run_store::RunStore` trait.
    pub fn with_services(config: ManagerConfig, services: Arc<ExecutorServices>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            config,
            workflows: dashmap::DashMap::new(),
            queue: Arc::new(PriorityQueue::new()),
            services,
            active: Arc::new(AtomicUsize::new(0)),
            in_flight: dashmap::DashMap::new(),
            observers: parking_lot::Mutex::new(Vec::new()),
            stop_tx,
            running: Arc::new(AtomicBool::new(false)),
            dispatch_handle: AsyncMutex::new(None),
        })
    }

    /// Registers (or replaces) a workflow definition under its name so
    /// triggers and sub-workflow recursion can resolve it later.
    pub fn register_workflow(&self, wf: Workflow) {
        self.workflows.insert(wf.name.clone(), Arc::new(wf));
    }

    pub fn get_workflow(&self, name: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(name).map(|w| w.clone())
    }

    pub fn on_run_state_change(&self, cb: RunObserver) {
        self.observers.lock().push(cb);
    }

    fn notify(&self, run: &RunRecord) {
        for cb in self.observers.lock().iter() {
            cb(run);
        }
    }

    /// Starts the dispatch loop as a background task. Idempotent: calling
    /// `start` twice while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let this = Arc::clone(self);
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.config.poll_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => this.dispatch_ready().await,
                    _ = stop_rx.changed() => {
                        info!("manager dispatch loop stopping");
                        break;
                    }
                }
            }
        });
        // `start`/`stop` gate the loop; the handle is parked for `stop` to
        // join without a blocking `.await` inside `start` itself.
        if let Ok(mut guard) = self.dispatch_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.dispatch_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.services.idempotency.sweep_expired();
    }

    async fn dispatch_ready(self: &Arc<Self>) {
        let now = Utc::now().timestamp_millis();
        for entry in self.queue.get_ready(now) {
            if self.active.load(Ordering::Acquire) >= self.config.max_concurrency {
                // Over cap — put it back for the next tick rather than drop it.
                self.queue.enqueue(entry);
                continue;
            }
            self.dispatch_one(entry).await;
        }
    }

    async fn dispatch_one(self: &Arc<Self>, entry: QueueEntry) {
        let Some(mut run) = self.services.run_store.get(entry.run_id).await.ok().flatten() else {
            warn!(run_id = %entry.run_id, "queue entry with no matching run record, dropping");
            return;
        };
        if run.status.is_terminal() {
            return;
        }
        let Some(wf) = self.get_workflow(&entry.workflow_name) else {
            warn!(workflow = %entry.workflow_name, "no workflow registered for queued run");
            return;
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        let cancel = crate::cancel::CancelToken::new();
        let paused = Arc::new(AtomicBool::new(false));
        self.in_flight.insert(run.id, RunHandle { cancel: cancel.clone(), paused: paused.clone() });

        let this = Arc::clone(self);
        let services = Arc::clone(&self.services);
        tokio::spawn(async move {
            let child_runner = this.child_runner(cancel.clone());
            let executor = WorkflowExecutor::new(services, cancel, paused, child_runner);
            let run_id = run.id;
            let _outcome = executor.run(&wf, &mut run).await;
            this.in_flight.remove(&run_id);
            this.active.fetch_sub(1, Ordering::AcqRel);

            // `executor.run` writes every status/terminal-field transition
            // straight to the run store rather than back onto its `&mut
            // RunRecord` parameter, so observers get the authoritative copy
            // by re-reading it rather than the (possibly stale-status) local.
            if let Ok(Some(final_run)) = this.services.run_store.get(run_id).await {
                this.notify(&final_run);
            }
        });
    }

    /// Builds the `ChildRunner` a `WorkflowExecutor` uses to recurse into a
    /// sub-workflow: resolves the child workflow by name, enforces the
    /// *parent* workflow's `max_sub_workflow_depth`, synthesizes a child
    /// `RunRecord` parented at `(parent_run_id, parent_node_id)`, and runs
    /// it to completion inline (recursion, not a queue round-trip) so the
    /// parent's own frontier loop can simply `.await` the result.
    fn child_runner(self: &Arc<Self>, parent_cancel: crate::cancel::CancelToken) -> ChildRunner {
        let this = Arc::clone(self);
        Arc::new(move |args: ChildSpawnArgs| {
            let this = Arc::clone(&this);
            let parent_cancel = parent_cancel.clone();
            Box::pin(async move { this.run_child(args, parent_cancel).await })
        })
    }

    async fn run_child(self: Arc<Self>, args: ChildSpawnArgs, parent_cancel: crate::cancel::CancelToken) -> Result<Value, EngineError> {
        let wf = self.get_workflow(&args.workflow_name).ok_or_else(|| EngineError::UnknownWorkflow(args.workflow_name.clone()))?;

        if args.depth > self.config.max_sub_workflow_depth {
            return Err(EngineError::MaxDepthExceeded { max_depth: self.config.max_sub_workflow_depth });
        }

        let mut child_run = RunRecord::new(wf.id, wf.name.clone(), args.input, 0, Utc::now().timestamp_millis(), vec![]);
        child_run.parent_run_id = Some(args.parent_run_id);
        child_run.parent_node_id = Some(args.parent_node_id.clone());
        child_run.depth = args.depth;
        self.services.run_store.save(child_run.clone()).await?;

        let child_cancel = parent_cancel.child();
        let paused = Arc::new(AtomicBool::new(false));
        let services = Arc::clone(&self.services);
        let child_runner = self.child_runner(child_cancel.clone());
        let executor = WorkflowExecutor::new(services, child_cancel, paused, child_runner);

        match executor.run(&wf, &mut child_run).await {
            RunOutcome::Completed(state) => Ok(state),
            RunOutcome::Failed(err) => Err(err),
            RunOutcome::Cancelled => Err(EngineError::Cancelled(child_run.id)),
            RunOutcome::Paused => Err(EngineError::NodeFatal {
                node_id: args.parent_node_id,
                message: "sub-workflow suspended on a human gate is not supported inline; register the child's own approval timeout".into(),
            }),
        }
    }

    /// Creates a run, schedules it for immediate dispatch, and blocks until
    /// it reaches a terminal status (or pauses — callers polling for
    /// synchronous semantics should treat `Paused` as "still outstanding").
    #[instrument(skip(self, wf, state_patch))]
    pub async fn execute(self: &Arc<Self>, wf: Workflow, state_patch: Option<Value>) -> Result<RunRecord, EngineError> {
        let run_id = self.schedule(wf, ScheduleOptions { at: Some(0), state_patch, ..Default::default() }).await?;
        loop {
            let run = self.services.run_store.get(run_id).await?.ok_or(EngineError::RunNotFound(run_id))?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Creates a `RunRecord`, registers the workflow if not already known,
    /// and enqueues it. Non-blocking.
    pub async fn schedule(self: &Arc<Self>, wf: Workflow, opts: ScheduleOptions) -> Result<Uuid, EngineError> {
        if self.get_workflow(&wf.name).is_none() {
            self.register_workflow(wf.clone());
        }
        let mut state = wf.initial_state.clone();
        if let Some(patch) = opts.state_patch {
            merge_into(&mut state, &patch);
        }
        let scheduled_for = opts.at.unwrap_or_else(|| Utc::now().timestamp_millis());
        let priority = opts.priority.unwrap_or(0);
        let run = RunRecord::new(wf.id, wf.name.clone(), state, priority, scheduled_for, opts.tags);
        let run_id = run.id;
        self.services.run_store.save(run).await?;
        self.queue.enqueue(QueueEntry { run_id, workflow_name: wf.name, priority, scheduled_for });
        Ok(run_id)
    }

    /// Sets the pause flag observed by the run's in-flight executor (if
    /// any) and removes it from the queue if it hasn't dispatched yet.
    pub async fn pause(&self, run_id: Uuid) -> Result<(), EngineError> {
        if let Some(handle) = self.in_flight.get(&run_id) {
            handle.paused.store(true, Ordering::Release);
            return Ok(());
        }
        let _ = self.queue.remove(run_id);
        self.services
            .run_store
            .update(run_id, Box::new(|r| r.status = RunStatus::Paused))
            .await?;
        Ok(())
    }

    /// Re-enqueues a paused run for immediate dispatch.
    pub async fn resume(self: &Arc<Self>, run_id: Uuid) -> Result<(), EngineError> {
        let run = self.services.run_store.get(run_id).await?.ok_or(EngineError::RunNotFound(run_id))?;
        if run.status != RunStatus::Paused {
            return Ok(());
        }
        self.queue.enqueue(QueueEntry {
            run_id,
            workflow_name: run.workflow_name.clone(),
            priority: run.priority,
            scheduled_for: Utc::now().timestamp_millis(),
        });
        Ok(())
    }

    /// Signals cancellation to the run's in-flight executor, or marks it
    /// cancelled directly if it hasn't dispatched yet. A no-op if the run
    /// is already terminal.
    pub async fn cancel(&self, run_id: Uuid, reason: Option<String>) -> Result<(), EngineError> {
        let run = self.services.run_store.get(run_id).await?.ok_or(EngineError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(());
        }
        if let Some(handle) = self.in_flight.get(&run_id) {
            handle.cancel.cancel();
            return Ok(());
        }
        let _ = self.queue.remove(run_id);
        self.services
            .run_store
            .update(
                run_id,
                Box::new(move |r| {
                    r.status = RunStatus::Cancelled;
                    r.completed_at = Some(Utc::now());
                    r.error = reason.map(|m| crate::models::RunError { name: "Cancelled".into(), message: m, stack: None });
                }),
            )
            .await?;
        Ok(())
    }

    /// Creates a fresh run from a failed one's workflow/state/priority/tags,
    /// and schedules it for immediate dispatch.
    pub async fn retry(self: &Arc<Self>, failed_run_id: Uuid) -> Result<Uuid, EngineError> {
        let failed = self.services.run_store.get(failed_run_id).await?.ok_or(EngineError::RunNotFound(failed_run_id))?;
        let wf = self.get_workflow(&failed.workflow_name).ok_or_else(|| EngineError::UnknownWorkflow(failed.workflow_name.clone()))?;
        let run = RunRecord::new(wf.id, failed.workflow_name.clone(), wf.initial_state.clone(), failed.priority, Utc::now().timestamp_millis(), failed.tags.clone());
        let run_id = run.id;
        self.services.run_store.save(run).await?;
        self.queue.enqueue(QueueEntry { run_id, workflow_name: wf.name.clone(), priority: failed.priority, scheduled_for: Utc::now().timestamp_millis() });
        Ok(run_id)
    }

    pub async fn get_status(&self, run_id: Uuid) -> Result<Option<RunRecord>, EngineError> {
        self.services.run_store.get(run_id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<RunRecord>, EngineError> {
        self.services.run_store.list(filter).await
    }

    pub async fn get_stats(&self) -> Result<RunStats, EngineError> {
        self.services.run_store.get_stats().await
    }

    pub fn get_active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub async fn cleanup(&self, older_than_ms: i64) -> Result<usize, EngineError> {
        self.services.run_store.cleanup(older_than_ms).await
    }
}

/// Shallow-key-overwrite merge, matching the executor's state-patch
/// semantics: undefined keys preserved, arrays replaced wholesale.
fn merge_into(state: &mut Value, patch: &Value) {
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

/// The manager is the sink every trigger (cron/webhook/event) fires into:
/// resolves the workflow by name and schedules an immediate run, tagging it
/// with the firing trigger's id so `listRuns(tags: [...])` can correlate.
#[async_trait]
impl FireSink for Manager {
    async fn fire(&self, workflow_name: &str, ctx: FireContext) -> Result<Uuid, TriggerError> {
        let wf = self
            .get_workflow(workflow_name)
            .ok_or_else(|| TriggerError::SinkRejected(format!("no workflow registered under '{workflow_name}'")))?;

        // `Manager::schedule` needs `Arc<Self>` to hand the dispatch loop a
        // clonable handle; trigger firing only needs to enqueue, so it's
        // inlined here against `&self` instead of requiring callers to hold
        // an `Arc<Manager>` just to implement `FireSink`.
        let mut state = wf.initial_state.clone();
        merge_into(&mut state, &ctx.payload);
        let tags = {
            let mut t = ctx.tags.clone();
            t.push(format!("trigger:{}", ctx.trigger_id));
            t
        };
        let scheduled_for = Utc::now().timestamp_millis();
        let run = RunRecord::new(wf.id, wf.name.clone(), state, 0, scheduled_for, tags);
        let run_id = run.id;
        self.services
            .run_store
            .save(run)
            .await
            .map_err(|e| TriggerError::SinkRejected(e.to_string()))?;
        self.queue.enqueue(QueueEntry { run_id, workflow_name: wf.name.clone(), priority: 0, scheduled_for });
        Ok(run_id)
    }
}
