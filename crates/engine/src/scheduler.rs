//! Dependency graph construction, execution-level assignment, frontier
//! computation, and edge evaluation (conditional/loop). Where a plain
//! topological sort only ever walks a linear chain of unconditional edges,
//! this module treats sequential and the forward half of parallel edges as
//! the DAG backbone, and defers conditional/loop edges to runtime predicate
//! evaluation.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::error::EngineError;
use crate::models::{Edge, Workflow};

/// Evaluates a `Conditional` edge's predicate key against the run's
/// current state, returning the node id(s) it selects. Only ids also
/// present in the edge's declared `targets` are honoured by the caller.
pub trait ConditionalPredicate: Send + Sync {
    fn targets(&self, state: &Value) -> Vec<String>;
}

/// Evaluates a `Loop` edge's predicate: `true` sends control back to
/// `back_to`, `false` exits to `exit_to`.
pub trait LoopPredicate: Send + Sync {
    fn should_loop(&self, state: &Value) -> bool;
}

#[derive(Clone, Default)]
pub struct PredicateRegistry {
    conditionals: HashMap<String, Arc<dyn ConditionalPredicate>>,
    loops: HashMap<String, Arc<dyn LoopPredicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_conditional(&mut self, key: impl Into<String>, p: Arc<dyn ConditionalPredicate>) {
        self.conditionals.insert(key.into(), p);
    }

    pub fn register_loop(&mut self, key: impl Into<String>, p: Arc<dyn LoopPredicate>) {
        self.loops.insert(key.into(), p);
    }

    /// Looks up a bool-valued predicate by key. Shared by loop edges and
    /// compensation gates (`CompensationSpec::condition`) — both just need
    /// "evaluate(state) -> bool", so there's no separate registration for
    /// compensation conditions; register them with `register_loop` too.
    pub(crate) fn loop_predicate(&self, key: &str) -> Option<Arc<dyn LoopPredicate>> {
        self.loops.get(key).cloned()
    }

    /// Looks up a conditional predicate by key. `pub(crate)` so the executor
    /// can re-evaluate a `Conditional` edge's routing alongside its own
    /// loop-body bookkeeping without duplicating `get_next_nodes`' error
    /// handling for unregistered predicates.
    pub(crate) fn conditional_predicate(&self, key: &str) -> Option<Arc<dyn ConditionalPredicate>> {
        self.conditionals.get(key).cloned()
    }
}

/// `deps[n]` = nodes that must complete before `n` can run.
/// `dependents[n]` = nodes that become eligible once `n` completes.
/// Built from sequential edges and the forward half of parallel edges
/// only — conditional/loop edges are evaluated at runtime and never
/// contribute to the static dependency graph.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub deps: HashMap<String, HashSet<String>>,
    pub dependents: HashMap<String, HashSet<String>>,
}

pub fn build_dependency_graph(wf: &Workflow) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    for id in wf.nodes.keys() {
        graph.deps.entry(id.clone()).or_default();
        graph.dependents.entry(id.clone()).or_default();
    }
    for edge in &wf.edges {
        let from = edge.from_node().to_owned();
        for to in edge.static_forward_targets() {
            graph.deps.entry(to.to_owned()).or_default().insert(from.clone());
            graph.dependents.entry(from.clone()).or_default().insert(to.to_owned());
        }
    }
    graph
}

/// Nodes in `pending` whose full dependency set is contained in `completed`.
pub fn get_ready_nodes<'a>(
    graph: &DependencyGraph,
    completed: &HashSet<String>,
    pending: &'a HashSet<String>,
) -> Vec<&'a str> {
    pending
        .iter()
        .filter(|n| graph.deps.get(n.as_str()).map(|d| d.is_subset(completed)).unwrap_or(true))
        .map(|s| s.as_str())
        .collect()
}

/// Kahn-style level assignment over the static dependency graph: level 0 is
/// every node with no dependencies, level k+1 is every node whose
/// dependencies are all satisfied by levels `0..=k`. Raises
/// `CyclicOrUnreachableNodes` if nodes remain pending with nothing ready —
/// this can only happen via a cycle in the sequential/parallel sub-graph,
/// since `WorkflowBuilder::build` already rejects those at construction
/// time; this is a defence-in-depth check for hand-built `Workflow`s.
pub fn get_execution_levels(wf: &Workflow) -> Result<Vec<Vec<String>>, EngineError> {
    let graph = build_dependency_graph(wf);
    let mut completed: HashSet<String> = HashSet::new();
    let mut pending: HashSet<String> = wf.nodes.keys().cloned().collect();
    let mut levels = Vec::new();

    while !pending.is_empty() {
        let ready: Vec<String> = get_ready_nodes(&graph, &completed, &pending).into_iter().map(String::from).collect();
        if ready.is_empty() {
            let mut remaining: Vec<String> = pending.into_iter().collect();
            remaining.sort();
            return Err(EngineError::CyclicOrUnreachableNodes(remaining));
        }
        for n in &ready {
            pending.remove(n);
            completed.insert(n.clone());
        }
        let mut level = ready;
        level.sort();
        levels.push(level);
    }

    Ok(levels)
}

/// One evaluated step out of a completed node: either a single id, a set
/// fired together by a parallel edge, or nothing (a dead-end branch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextNodes {
    None,
    One(String),
    Many(Vec<String>),
}

impl NextNodes {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            NextNodes::None => Vec::new(),
            NextNodes::One(n) => vec![n],
            NextNodes::Many(ns) => ns,
        }
    }
}

/// Evaluates every outgoing edge of `current_node` against `state`,
/// deduplicating targets while preserving first-seen order.
pub fn get_next_nodes(
    wf: &Workflow,
    current_node: &str,
    state: &Value,
    predicates: &PredicateRegistry,
) -> Result<NextNodes, EngineError> {
    let mut seen = HashSet::new();
    let mut ordered = Vec::new();

    for edge in &wf.edges {
        if edge.from_node() != current_node {
            continue;
        }
        match edge {
            Edge::Sequential { to, .. } => push_unique(&mut ordered, &mut seen, to.clone()),
            Edge::Parallel { to, .. } => {
                for t in to {
                    push_unique(&mut ordered, &mut seen, t.clone());
                }
            }
            Edge::Conditional { predicate, targets, .. } => {
                let p = predicates.conditionals.get(predicate).ok_or_else(|| EngineError::UnknownPredicate(predicate.clone()))?;
                for candidate in p.targets(state) {
                    if targets.contains(&candidate) {
                        push_unique(&mut ordered, &mut seen, candidate);
                    }
                }
            }
            Edge::Loop { predicate, back_to, exit_to, .. } => {
                let p = predicates.loops.get(predicate).ok_or_else(|| EngineError::UnknownPredicate(predicate.clone()))?;
                let target = if p.should_loop(state) { back_to } else { exit_to };
                push_unique(&mut ordered, &mut seen, target.clone());
            }
        }
    }

    Ok(match ordered.len() {
        0 => NextNodes::None,
        1 => NextNodes::One(ordered.into_iter().next().unwrap()),
        _ => NextNodes::Many(ordered),
    })
}

fn push_unique(ordered: &mut Vec<String>, seen: &mut HashSet<String>, id: String) {
    if seen.insert(id.clone()) {
        ordered.push(id);
    }
}

/// Runs `tasks` in fixed-size chunks of `max_concurrency`, joining at each
/// chunk boundary before starting the next. Deliberately simpler than a
/// promise-race-plus-array-replace idiom, which can silently lose tasks
/// under contention — a chunked barrier can never drop a task, only (at
/// worst) underutilise concurrency at a chunk edge. Result order matches
/// input order.
pub async fn run_parallel<T, F, Fut>(tasks: Vec<F>, max_concurrency: usize) -> Vec<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let max_concurrency = max_concurrency.max(1);
    let mut results = Vec::with_capacity(tasks.len());
    let mut iter = tasks.into_iter();
    loop {
        let chunk: Vec<F> = (&mut iter).take(max_concurrency).collect();
        if chunk.is_empty() {
            break;
        }
        let futures: Vec<Fut> = chunk.into_iter().map(|f| f()).collect();
        let mut chunk_results = futures::future::join_all(futures).await;
        results.append(&mut chunk_results);
    }
    results
}

/// Validates the structural invariants `WorkflowBuilder::build` enforces:
/// unique node ids (guaranteed by `IndexMap` at insertion, re-checked here
/// for hand-built workflows), every edge endpoint exists, the
/// sequential+parallel+forward-conditional sub-graph is acyclic, and every
/// loop edge's `back_to` is reachable from its `from`.
pub fn validate_workflow(wf: &Workflow) -> Result<(), EngineError> {
    for edge in &wf.edges {
        let mut check = |id: &str, side: &'static str| -> Result<(), EngineError> {
            if !wf.nodes.contains_key(id) {
                return Err(EngineError::UnknownNodeReference { node_id: id.to_owned(), side });
            }
            Ok(())
        };
        check(edge.from_node(), "from")?;
        match edge {
            Edge::Sequential { to, .. } => check(to, "to")?,
            Edge::Parallel { to, .. } => {
                for t in to {
                    check(t, "to")?;
                }
            }
            Edge::Conditional { targets, .. } => {
                for t in targets {
                    check(t, "to")?;
                }
            }
            Edge::Loop { back_to, exit_to, .. } => {
                check(back_to, "to")?;
                check(exit_to, "to")?;
            }
        }
    }

    // Acyclicity of the sequential+parallel+forward-conditional sub-graph
    // (per §3's invariant — a broader graph than the scheduler's runtime
    // dependency graph, which only ever tracks sequential+parallel since
    // conditional targets aren't true prerequisites for frontier
    // computation).
    let forward = build_forward_graph(wf);
    if let Some(cycle_member) = find_cycle(wf, &forward) {
        let _ = cycle_member;
        return Err(EngineError::CycleDetected);
    }

    // Every loop edge's back_to must be reachable from its from.
    for edge in &wf.edges {
        if let Edge::Loop { from, back_to, .. } = edge {
            if !reachable(&forward, back_to, from) {
                return Err(EngineError::UnreachableLoopTarget { from: from.clone(), back_to: back_to.clone() });
            }
        }
    }

    Ok(())
}

/// Forward adjacency over sequential + parallel + conditional-target edges
/// (everything except loop back-edges), used for build-time acyclicity and
/// loop-reachability checks.
fn build_forward_graph(wf: &Workflow) -> HashMap<String, HashSet<String>> {
    let mut adj: HashMap<String, HashSet<String>> = wf.nodes.keys().map(|k| (k.clone(), HashSet::new())).collect();
    for edge in &wf.edges {
        let from = edge.from_node().to_owned();
        let targets: Vec<&str> = match edge {
            Edge::Sequential { to, .. } => vec![to.as_str()],
            Edge::Parallel { to, .. } => to.iter().map(String::as_str).collect(),
            Edge::Conditional { targets, .. } => targets.iter().map(String::as_str).collect(),
            Edge::Loop { .. } => Vec::new(),
        };
        for t in targets {
            adj.entry(from.clone()).or_default().insert(t.to_owned());
        }
    }
    adj
}

/// DFS cycle detection over an arbitrary forward adjacency map.
fn find_cycle(wf: &Workflow, adj: &HashMap<String, HashSet<String>>) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }
    let mut marks: HashMap<&str, Mark> = HashMap::new();

    fn visit<'a>(node: &'a str, adj: &'a HashMap<String, HashSet<String>>, marks: &mut HashMap<&'a str, Mark>) -> bool {
        match marks.get(node) {
            Some(Mark::Done) => return false,
            Some(Mark::Visiting) => return true,
            None => {}
        }
        marks.insert(node, Mark::Visiting);
        if let Some(next) = adj.get(node) {
            for n in next {
                if visit(n.as_str(), adj, marks) {
                    return true;
                }
            }
        }
        marks.insert(node, Mark::Done);
        false
    }

    for id in wf.nodes.keys() {
        if visit(id.as_str(), adj, &mut marks) {
            return Some(id.clone());
        }
    }
    None
}

/// Whether `target` is reachable from `start` by following forward edges
/// (used to check a loop's `back_to` is already reachable from its `from`,
/// i.e. is genuinely a back-edge and not a typo).
fn reachable(adj: &HashMap<String, HashSet<String>>, target: &str, start: &str) -> bool {
    if target == start {
        return true;
    }
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start.to_owned());
    visited.insert(start.to_owned());
    while let Some(node) = queue.pop_front() {
        if let Some(next) = adj.get(&node) {
            for n in next {
                if n == target {
                    return true;
                }
                if visited.insert(n.clone()) {
                    queue.push_back(n.clone());
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::WorkflowBuilder;
    use serde_json::json;

    struct AlwaysTrue;
    impl LoopPredicate for AlwaysTrue {
        fn should_loop(&self, _state: &Value) -> bool {
            false
        }
    }

    fn linear_wf(ids: &[&str]) -> Workflow {
        let mut b = WorkflowBuilder::new("wf").initial_state(json!({}));
        for id in ids {
            b = b.add_node(crate::models::NodeSpec::function(*id, "mock"));
        }
        for pair in ids.windows(2) {
            b = b.add_sequential(pair[0], pair[1]);
        }
        b.build().unwrap()
    }

    #[test]
    fn execution_levels_linear() {
        let wf = linear_wf(&["a", "b", "c"]);
        let levels = get_execution_levels(&wf).unwrap();
        assert_eq!(levels, vec![vec!["a".to_string()], vec!["b".to_string()], vec!["c".to_string()]]);
    }

    #[test]
    fn execution_levels_diamond_groups_siblings() {
        let mut b = WorkflowBuilder::new("wf").initial_state(json!({}));
        for id in ["a", "b", "c", "d"] {
            b = b.add_node(crate::models::NodeSpec::function(id, "mock"));
        }
        let wf = b
            .add_parallel("a", vec!["b".into(), "c".into()])
            .add_sequential("b", "d")
            .add_sequential("c", "d")
            .build()
            .unwrap();
        let levels = get_execution_levels(&wf).unwrap();
        assert_eq!(levels[0], vec!["a"]);
        assert_eq!(levels[1], vec!["b", "c"]);
        assert_eq!(levels[2], vec!["d"]);
    }

    #[test]
    fn get_next_nodes_dedupes_preserving_order() {
        let mut b = WorkflowBuilder::new("wf").initial_state(json!({}));
        for id in ["a", "b", "c"] {
            b = b.add_node(crate::models::NodeSpec::function(id, "mock"));
        }
        let wf = b.add_parallel("a", vec!["b".into(), "c".into(), "b".into()]).build().unwrap();
        let next = get_next_nodes(&wf, "a", &json!({}), &PredicateRegistry::new()).unwrap();
        assert_eq!(next, NextNodes::Many(vec!["b".to_string(), "c".to_string()]));
    }

    #[tokio::test]
    async fn run_parallel_preserves_result_order_across_chunks() {
        let tasks: Vec<_> = (0..5)
            .map(|i| move || async move {
                tokio::time::sleep(std::time::Duration::from_millis((5 - i) as u64)).await;
                i
            })
            .collect();
        let results = run_parallel(tasks, 2).await;
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cyclic_graph_outside_loop_edges_is_rejected() {
        let mut b = WorkflowBuilder::new("wf").initial_state(json!({}));
        for id in ["a", "b"] {
            b = b.add_node(crate::models::NodeSpec::function(id, "mock"));
        }
        let wf = Workflow {
            edges: vec![
                Edge::Sequential { from: "a".into(), to: "b".into() },
                Edge::Sequential { from: "b".into(), to: "a".into() },
            ],
            ..b.build_unchecked()
        };
        assert!(matches!(get_execution_levels(&wf), Err(EngineError::CyclicOrUnreachableNodes(_))));
    }

    proptest::proptest! {
        /// DAG correctness (distilled spec §8.1): for any chain built from a
        /// random shuffle of sequential edges over a fixed id set, every
        /// node's execution level is strictly greater than every one of its
        /// dependencies' levels.
        #[test]
        fn chain_execution_levels_respect_dependency_order(len in 2usize..12) {
            let ids: Vec<String> = (0..len).map(|i| format!("n{i}")).collect();
            let wf = linear_wf(&ids.iter().map(String::as_str).collect::<Vec<_>>());
            let levels = get_execution_levels(&wf).unwrap();

            let level_of: HashMap<&str, usize> = levels
                .iter()
                .enumerate()
                .flat_map(|(i, level)| level.iter().map(move |id| (id.as_str(), i)))
                .collect();

            for pair in ids.windows(2) {
                proptest::prop_assert!(level_of[pair[1].as_str()] > level_of[pair[0].as_str()]);
            }
        }
    }
}
