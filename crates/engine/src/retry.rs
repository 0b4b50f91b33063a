//! Retry policy: backoff computation, error classification, and the
//! `execute_with_retry` driver every node call runs through.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use nodes::NodeError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential { multiplier: f64 },
}

/// Tuning knobs for a single node's retry behaviour.
#[derive(Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub strategy: BackoffStrategy,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
    /// Fraction of the computed delay randomised by +/-, in `[0, 1]`.
    pub jitter: f64,
    /// Skips (de)serialisation — callers that need a non-default
    /// classifier construct it after deserialising the policy shape.
    #[serde(skip, default = "default_classifier_arc")]
    pub classifier: Arc<dyn Fn(&NodeError) -> bool + Send + Sync>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("strategy", &self.strategy)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("max_retries", &self.max_retries)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: 3,
            jitter: 0.1,
            classifier: default_classifier_arc(),
        }
    }
}

impl RetryPolicy {
    pub fn with_classifier(
        mut self,
        classifier: impl Fn(&NodeError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.classifier = Arc::new(classifier);
        self
    }

    /// Delay before attempt `k + 1` (`k` is 1-indexed), pre-jitter, capped
    /// at `max_delay`.
    fn base_delay(&self, k: u32) -> Duration {
        let raw = match self.strategy {
            BackoffStrategy::Constant => self.initial_delay,
            BackoffStrategy::Linear => self.initial_delay * k,
            BackoffStrategy::Exponential { multiplier } => {
                let factor = multiplier.powi((k - 1) as i32);
                Duration::from_secs_f64(self.initial_delay.as_secs_f64() * factor)
            }
        };
        raw.min(self.max_delay)
    }

    fn jittered_delay(&self, k: u32) -> Duration {
        let base = self.base_delay(k).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let spread = rand::thread_rng().gen_range(-1.0f64..=1.0f64);
        let jittered = base * (1.0 + self.jitter * spread);
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

fn default_classifier_arc() -> Arc<dyn Fn(&NodeError) -> bool + Send + Sync> {
    Arc::new(default_classifier)
}

/// Default retryability classification: explicit `Retryable`/`Timeout`
/// variants, and `Fatal` errors whose message looks like a transient
/// network/dependency failure (connection reset/refused/timeout,
/// unresolved host, HTTP 429/5xx-family).
pub fn default_classifier(err: &NodeError) -> bool {
    match err {
        NodeError::Retryable(_) | NodeError::Timeout(_) => true,
        NodeError::CircuitOpen(_) => false,
        NodeError::Cancelled => false,
        NodeError::Fatal(msg) => {
            let lower = msg.to_lowercase();
            const NEEDLES: &[&str] = &[
                "connection reset",
                "connection refused",
                "timed out",
                "timeout",
                "econnreset",
                "econnrefused",
                "etimedout",
                "enotfound",
                "could not resolve host",
                "429",
                "500",
                "502",
                "503",
                "504",
            ];
            NEEDLES.iter().any(|n| lower.contains(n))
        }
    }
}

/// Hooks fired around each attempt. All are optional; a manager or executor
/// wires in `tracing` calls and metrics via these.
#[derive(Clone, Default)]
pub struct RetryHooks {
    pub on_attempt: Option<Arc<dyn Fn(u32) + Send + Sync>>,
    pub on_retry: Option<Arc<dyn Fn(u32, Duration, &NodeError) + Send + Sync>>,
    pub on_success: Option<Arc<dyn Fn(u32, Duration) + Send + Sync>>,
    pub on_failure: Option<Arc<dyn Fn(u32, Duration, &NodeError) + Send + Sync>>,
}

/// Full accounting of one `execute_with_retry` call.
pub struct RetryOutcome<T> {
    pub result: Result<T, NodeError>,
    pub attempts: u32,
    pub delays: Vec<Duration>,
    pub duration: Duration,
}

/// Runs `f` under `policy`, sleeping between attempts per the backoff
/// strategy, stopping when the classifier says an error isn't retryable or
/// `max_retries` is exhausted. Checks `cancel` before every attempt and
/// before every sleep; a signalled cancel short-circuits with
/// `NodeError::Cancelled`.
pub async fn execute_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancelToken,
    hooks: &RetryHooks,
    mut f: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let start = Instant::now();
    let mut delays = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(NodeError::Cancelled),
                attempts: attempt - 1,
                delays,
                duration: start.elapsed(),
            };
        }

        if let Some(cb) = &hooks.on_attempt {
            cb(attempt);
        }

        match f(attempt).await {
            Ok(value) => {
                if let Some(cb) = &hooks.on_success {
                    cb(attempt, start.elapsed());
                }
                if attempt > 1 {
                    info!(attempt, "node succeeded after retry");
                }
                return RetryOutcome { result: Ok(value), attempts: attempt, delays, duration: start.elapsed() };
            }
            Err(err) => {
                let retryable = (policy.classifier)(&err);
                let exhausted = attempt > policy.max_retries;

                if !retryable || exhausted {
                    if let Some(cb) = &hooks.on_failure {
                        cb(attempt, start.elapsed(), &err);
                    }
                    return RetryOutcome { result: Err(err), attempts: attempt, delays, duration: start.elapsed() };
                }

                let delay = policy.jittered_delay(attempt);
                delays.push(delay);
                warn!(attempt, max_retries = policy.max_retries, ?delay, %err, "node call failed, retrying");
                if let Some(cb) = &hooks.on_retry {
                    cb(attempt, delay, &err);
                }

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return RetryOutcome {
                            result: Err(NodeError::Cancelled),
                            attempts: attempt,
                            delays,
                            duration: start.elapsed(),
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use test_case::test_case;

    #[tokio::test]
    async fn succeeds_immediately_without_retrying() {
        let policy = RetryPolicy { initial_delay: Duration::from_millis(1), ..Default::default() };
        let cancel = CancelToken::new();
        let outcome = execute_with_retry(&policy, &cancel, &RetryHooks::default(), |_| async { Ok::<_, NodeError>(42) }).await;
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap(), 42);
        assert!(outcome.delays.is_empty());
    }

    #[tokio::test]
    async fn retries_up_to_max_then_gives_up() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_retries: 2,
            jitter: 0.0,
            ..Default::default()
        };
        let calls = AtomicU32::new(0);
        let cancel = CancelToken::new();
        let outcome = execute_with_retry(&policy, &cancel, &RetryHooks::default(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(NodeError::Retryable("flaky".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3); // initial + 2 retries
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let policy = RetryPolicy { initial_delay: Duration::from_millis(1), ..Default::default() };
        let cancel = CancelToken::new();
        let outcome = execute_with_retry(&policy, &cancel, &RetryHooks::default(), |_| async {
            Err::<(), _>(NodeError::Fatal("business rule violated".into()))
        })
        .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt_short_circuits() {
        let policy = RetryPolicy::default();
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = execute_with_retry(&policy, &cancel, &RetryHooks::default(), |_| async { Ok::<_, NodeError>(1) }).await;
        assert!(matches!(outcome.result, Err(NodeError::Cancelled)));
    }

    #[test]
    fn exponential_backoff_doubles_then_caps() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Exponential { multiplier: 2.0 },
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_retries: 5,
            jitter: 0.0,
            ..Default::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(350)); // capped from 400
    }

    #[test]
    fn default_classifier_matches_network_like_messages() {
        assert!(default_classifier(&NodeError::Fatal("connection reset by peer".into())));
        assert!(default_classifier(&NodeError::Fatal("upstream returned 503".into())));
        assert!(!default_classifier(&NodeError::Fatal("invalid account balance".into())));
        assert!(!default_classifier(&NodeError::CircuitOpen("api".into())));
    }

    #[test_case("connection reset by peer", true; "connection reset")]
    #[test_case("connection refused", true; "connection refused")]
    #[test_case("request timed out", true; "timed out phrasing")]
    #[test_case("client timeout", true; "timeout phrasing")]
    #[test_case("ECONNRESET", true; "econnreset errno-style")]
    #[test_case("ECONNREFUSED", true; "econnrefused errno-style")]
    #[test_case("ETIMEDOUT", true; "etimedout errno-style")]
    #[test_case("ENOTFOUND", true; "enotfound errno-style")]
    #[test_case("could not resolve host", true; "dns resolution failure")]
    #[test_case("upstream returned 429", true; "http 429")]
    #[test_case("upstream returned 500", true; "http 500")]
    #[test_case("upstream returned 502", true; "http 502")]
    #[test_case("upstream returned 503", true; "http 503")]
    #[test_case("upstream returned 504", true; "http 504")]
    #[test_case("invalid account balance", false; "business rule violation")]
    #[test_case("validation failed: missing field", false; "validation error")]
    #[test_case("upstream returned 404", false; "http 404 is not retried")]
    #[test_case("upstream returned 400", false; "http 400 is not retried")]
    fn default_classifier_message_boundary_table(message: &str, expect_retryable: bool) {
        assert_eq!(default_classifier(&NodeError::Fatal(message.into())), expect_retryable);
    }

    #[test_case(NodeError::Retryable("flaky".into()), true; "explicit retryable variant")]
    #[test_case(NodeError::Timeout("slow".into()), true; "explicit timeout variant")]
    #[test_case(NodeError::CircuitOpen("api".into()), false; "circuit open is never retried")]
    #[test_case(NodeError::Cancelled, false; "cancellation is never retried")]
    fn default_classifier_non_fatal_variants(err: NodeError, expect_retryable: bool) {
        assert_eq!(default_classifier(&err), expect_retryable);
    }
}
