//! `MockNode` — a test double for `ExecutableNode`.
//!
//! Useful in unit and integration tests where a real node implementation is
//! either unavailable or irrelevant.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::{traits::ExecutionContext, ExecutableNode, NodeError};

/// Behaviour injected into `MockNode` at construction time.
pub enum MockBehaviour {
    /// Return a specific JSON value.
    ReturnValue(Value),
    /// Fail with a `Retryable` error.
    FailRetryable(String),
    /// Fail with a `Fatal` error.
    FailFatal(String),
    /// Fail with a `Timeout` error.
    FailTimeout(String),
    /// Fail the first `n` calls with `Timeout`, then return `value`.
    FailNTimesThenSucceed { n: usize, value: Value },
}

/// A mock node that records every call it receives and returns a
/// programmer-specified result.
pub struct MockNode {
    /// Label used in test assertions.
    pub name: String,
    /// What the node will do when `execute` is called.
    pub behaviour: MockBehaviour,
    /// All inputs seen by this node (in call order).
    pub calls: Arc<Mutex<Vec<Value>>>,
    call_index: AtomicUsize,
}

impl MockNode {
    /// Create a mock that always succeeds with the given value.
    pub fn returning(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, MockBehaviour::ReturnValue(value))
    }

    /// Create a mock that always fails with a `Fatal` error.
    pub fn failing_fatal(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::FailFatal(msg.into()))
    }

    /// Create a mock that always fails with a `Retryable` error.
    pub fn failing_retryable(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::new(name, MockBehaviour::FailRetryable(msg.into()))
    }

    /// Create a mock that fails `n` times with `Timeout`, then succeeds.
    pub fn failing_then_succeeding(name: impl Into<String>, n: usize, value: Value) -> Self {
        Self::new(name, MockBehaviour::FailNTimesThenSucceed { n, value })
    }

    fn new(name: impl Into<String>, behaviour: MockBehaviour) -> Self {
        Self {
            name: name.into(),
            behaviour,
            calls: Arc::new(Mutex::new(Vec::new())),
            call_index: AtomicUsize::new(0),
        }
    }

    /// Number of times this node has been executed.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutableNode for MockNode {
    async fn execute(&self, state: Value, _ctx: &ExecutionContext) -> Result<Value, NodeError> {
        self.calls.lock().unwrap().push(state.clone());
        let call_no = self.call_index.fetch_add(1, Ordering::SeqCst);

        match &self.behaviour {
            MockBehaviour::ReturnValue(v) => Ok(merge_marker(&self.name, v)),
            MockBehaviour::FailRetryable(msg) => Err(NodeError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(NodeError::Fatal(msg.clone())),
            MockBehaviour::FailTimeout(msg) => Err(NodeError::Timeout(msg.clone())),
            MockBehaviour::FailNTimesThenSucceed { n, value } => {
                if call_no < *n {
                    Err(NodeError::Timeout(format!("attempt {} of {} pre-scripted failures", call_no + 1, n)))
                } else {
                    Ok(merge_marker(&self.name, value))
                }
            }
        }
    }
}

/// Merge the incoming patch `v` with a `{"node": name}` marker so tests can
/// trace which mock produced a given patch.
fn merge_marker(name: &str, v: &Value) -> Value {
    let mut out = json!({ "node": name });
    if let (Some(out_obj), Some(v_obj)) = (out.as_object_mut(), v.as_object()) {
        for (k, val) in v_obj {
            out_obj.insert(k.clone(), val.clone());
        }
    }
    out
}
