//! Lookup tables the manager hands to the executor: node implementations by
//! `node_type`, and state mappers by key for sub-workflow input/output
//! shaping.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use nodes::ExecutableNode;

/// Maps `node_type` strings to boxed `ExecutableNode` implementations.
pub type NodeRegistry = HashMap<String, Arc<dyn ExecutableNode>>;

/// A named state transform, used by `SubWorkflowSpec::input_mapper` and
/// `output_mapper` to shape state crossing a parent/child boundary.
pub trait StateMapper: Send + Sync {
    fn map(&self, state: &Value) -> Value;
}

/// Maps `MapperRegistry` keys to `StateMapper` implementations. `None`
/// (identity) is handled by callers rather than a registered entry.
pub type MapperRegistry = HashMap<String, Arc<dyn StateMapper>>;
