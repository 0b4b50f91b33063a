//! `WorkflowBuilder` — the external interface for assembling a
//! [`Workflow`](crate::models::Workflow). `build()` runs the full
//! validation pass from `scheduler::validate_workflow` before handing back
//! an immutable definition.

use indexmap::IndexMap;
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::models::{Edge, NodeSpec, TriggerKind, Workflow};
use crate::scheduler::validate_workflow;

pub struct WorkflowBuilder {
    name: String,
    trigger: TriggerKind,
    initial_state: Value,
    nodes: IndexMap<String, NodeSpec>,
    edges: Vec<Edge>,
    max_concurrency: usize,
    max_sub_workflow_depth: u32,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            trigger: TriggerKind::Manual,
            initial_state: Value::Object(Default::default()),
            nodes: IndexMap::new(),
            edges: Vec::new(),
            max_concurrency: 4,
            max_sub_workflow_depth: 10,
        }
    }

    pub fn trigger(mut self, trigger: TriggerKind) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn initial_state(mut self, state: Value) -> Self {
        self.initial_state = state;
        self
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n;
        self
    }

    pub fn max_sub_workflow_depth(mut self, n: u32) -> Self {
        self.max_sub_workflow_depth = n;
        self
    }

    pub fn add_node(mut self, node: NodeSpec) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn add_sequential(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge::Sequential { from: from.into(), to: to.into() });
        self
    }

    pub fn add_parallel(mut self, from: impl Into<String>, to: Vec<String>) -> Self {
        self.edges.push(Edge::Parallel { from: from.into(), to });
        self
    }

    pub fn add_conditional(mut self, from: impl Into<String>, predicate: impl Into<String>, targets: Vec<String>) -> Self {
        self.edges.push(Edge::Conditional { from: from.into(), predicate: predicate.into(), targets });
        self
    }

    pub fn add_loop(
        mut self,
        from: impl Into<String>,
        predicate: impl Into<String>,
        back_to: impl Into<String>,
        exit_to: impl Into<String>,
    ) -> Self {
        self.edges.push(Edge::Loop { from: from.into(), predicate: predicate.into(), back_to: back_to.into(), exit_to: exit_to.into() });
        self
    }

    /// Validates and finalises the workflow. Checks (in this order): every
    /// edge endpoint exists; the sequential+parallel+forward-conditional
    /// sub-graph is acyclic; every loop edge's `back_to` is reachable from
    /// its `from`.
    pub fn build(self) -> Result<Workflow, EngineError> {
        let wf = self.build_unchecked();
        validate_workflow(&wf)?;
        Ok(wf)
    }

    /// Assembles the `Workflow` without running validation. Used
    /// internally by `build()` and by scheduler tests that need to
    /// construct a deliberately invalid graph.
    pub(crate) fn build_unchecked(self) -> Workflow {
        Workflow {
            id: Uuid::new_v4(),
            name: self.name,
            trigger: self.trigger,
            initial_state: self.initial_state,
            nodes: self.nodes,
            edges: self.edges,
            max_concurrency: self.max_concurrency,
            max_sub_workflow_depth: self.max_sub_workflow_depth,
            created_at: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeSpec;
    use serde_json::json;

    #[test]
    fn empty_workflow_builds_successfully() {
        let wf = WorkflowBuilder::new("empty").initial_state(json!({})).build().unwrap();
        assert!(wf.nodes.is_empty());
    }

    #[test]
    fn duplicate_node_id_overwrites_rather_than_erroring_indexmap_semantics() {
        let wf = WorkflowBuilder::new("wf")
            .add_node(NodeSpec::function("a", "mock"))
            .add_node(NodeSpec::function("a", "other"))
            .build()
            .unwrap();
        assert_eq!(wf.nodes.len(), 1);
    }

    #[test]
    fn edge_to_unknown_node_is_rejected() {
        let result = WorkflowBuilder::new("wf").add_node(NodeSpec::function("a", "mock")).add_sequential("a", "ghost").build();
        assert!(result.is_err());
    }

    #[test]
    fn loop_edge_must_reach_back_to_reachable_node() {
        let result = WorkflowBuilder::new("wf")
            .add_node(NodeSpec::function("a", "mock"))
            .add_node(NodeSpec::function("b", "mock"))
            .add_node(NodeSpec::function("isolated", "mock"))
            .add_sequential("a", "b")
            .add_loop("b", "always", "isolated", "a")
            .build();
        assert!(matches!(result, Err(EngineError::UnreachableLoopTarget { .. })));
    }
}
