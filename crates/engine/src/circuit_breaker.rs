//! Per-key circuit breaker: closed/open/half-open state machine gating a
//! function call. Backed by `DashMap` so each key's state is independently
//! lockable — a busy key never blocks callers working a different one.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub reset_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

struct CircuitState {
    kind: CircuitStateKind,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl CircuitState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            kind: CircuitStateKind::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            config,
        }
    }

    /// Moves `open -> half-open` if the reset timeout has elapsed. Must be
    /// called before every admission check.
    fn refresh(&mut self) {
        if self.kind == CircuitStateKind::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.config.reset_timeout {
                    self.kind = CircuitStateKind::HalfOpen;
                    self.success_count = 0;
                }
            }
        }
    }
}

/// A snapshot of one key's circuit state, safe to hand out to callers.
#[derive(Debug, Clone, Copy)]
pub struct CircuitSnapshot {
    pub kind: CircuitStateKind,
    pub failure_count: u32,
    pub success_count: u32,
}

/// Error returned when a call is rejected because its key's circuit is open.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker open for key '{0}'")]
pub struct CircuitBreakerOpenError(pub String);

/// Process-wide registry of per-key circuit state, shared by reference
/// across every executor.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    states: Arc<DashMap<String, Mutex<CircuitState>>>,
    default_config: CircuitBreakerConfig,
    on_transition: Arc<DashMap<(), Vec<Arc<dyn Fn(&str, CircuitStateKind) + Send + Sync>>>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            states: Arc::new(DashMap::new()),
            default_config,
            on_transition: Arc::new(DashMap::new()),
        }
    }

    /// Register a callback invoked on every state transition for any key.
    pub fn on_transition(&self, cb: impl Fn(&str, CircuitStateKind) + Send + Sync + 'static) {
        self.on_transition.entry(()).or_default().push(Arc::new(cb));
    }

    fn notify(&self, key: &str, kind: CircuitStateKind) {
        if let Some(cbs) = self.on_transition.get(&()) {
            for cb in cbs.iter() {
                cb(key, kind);
            }
        }
    }

    fn entry(&self, key: &str, config: Option<CircuitBreakerConfig>) -> dashmap::mapref::one::Ref<'_, String, Mutex<CircuitState>> {
        self.states
            .entry(key.to_owned())
            .or_insert_with(|| Mutex::new(CircuitState::new(config.unwrap_or(self.default_config))))
            .downgrade()
    }

    pub fn can_execute(&self, key: &str) -> bool {
        let guard = self.entry(key, None);
        let mut state = guard.lock();
        state.refresh();
        state.kind != CircuitStateKind::Open
    }

    pub fn get_state(&self, key: &str) -> CircuitSnapshot {
        let guard = self.entry(key, None);
        let mut state = guard.lock();
        state.refresh();
        CircuitSnapshot { kind: state.kind, failure_count: state.failure_count, success_count: state.success_count }
    }

    pub fn record_success(&self, key: &str) {
        let guard = self.entry(key, None);
        let mut state = guard.lock();
        state.refresh();
        match state.kind {
            CircuitStateKind::Closed => {
                state.failure_count = 0;
            }
            CircuitStateKind::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= state.config.success_threshold {
                    state.kind = CircuitStateKind::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    info!(key, "circuit breaker closed");
                    drop(state);
                    self.notify(key, CircuitStateKind::Closed);
                }
            }
            CircuitStateKind::Open => {}
        }
    }

    pub fn record_failure(&self, key: &str) {
        let guard = self.entry(key, None);
        let mut state = guard.lock();
        state.refresh();
        match state.kind {
            CircuitStateKind::Closed => {
                state.failure_count += 1;
                if state.failure_count >= state.config.threshold {
                    state.kind = CircuitStateKind::Open;
                    state.opened_at = Some(Instant::now());
                    info!(key, "circuit breaker opened");
                    drop(state);
                    self.notify(key, CircuitStateKind::Open);
                }
            }
            CircuitStateKind::HalfOpen => {
                state.kind = CircuitStateKind::Open;
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
                info!(key, "circuit breaker re-opened after half-open failure");
                drop(state);
                self.notify(key, CircuitStateKind::Open);
            }
            CircuitStateKind::Open => {}
        }
    }

    pub fn reset(&self, key: &str) {
        self.states.remove(key);
    }

    /// Configure a specific key with a non-default threshold/timeout,
    /// overwriting any existing state for it.
    pub fn configure(&self, key: &str, config: CircuitBreakerConfig) {
        self.states.insert(key.to_owned(), Mutex::new(CircuitState::new(config)));
    }

    /// Admission-checked call: rejects immediately if `key`'s circuit is
    /// open, otherwise runs `f` and records the outcome.
    pub async fn execute<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, CircuitCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.can_execute(key) {
            return Err(CircuitCallError::Open(CircuitBreakerOpenError(key.to_owned())));
        }
        match f().await {
            Ok(v) => {
                self.record_success(key);
                Ok(v)
            }
            Err(e) => {
                self.record_failure(key);
                Err(CircuitCallError::Inner(e))
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitCallError<E> {
    #[error(transparent)]
    Open(#[from] CircuitBreakerOpenError),
    #[error(transparent)]
    Inner(E),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig { threshold: 3, reset_timeout: Duration::from_millis(20), success_threshold: 2 }
    }

    #[test]
    fn closed_opens_after_threshold_failures() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        reg.record_failure("api");
        reg.record_failure("api");
        assert_eq!(reg.get_state("api").kind, CircuitStateKind::Closed);
        reg.record_failure("api");
        assert_eq!(reg.get_state("api").kind, CircuitStateKind::Open);
        assert!(!reg.can_execute("api"));
    }

    #[test]
    fn success_resets_failure_count_in_closed_state() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        reg.record_failure("api");
        reg.record_failure("api");
        reg.record_success("api");
        assert_eq!(reg.get_state("api").failure_count, 0);
    }

    #[tokio::test]
    async fn half_open_after_reset_timeout_then_closes_on_successes() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        reg.record_failure("api");
        reg.record_failure("api");
        reg.record_failure("api");
        assert_eq!(reg.get_state("api").kind, CircuitStateKind::Open);

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(reg.can_execute("api"));
        assert_eq!(reg.get_state("api").kind, CircuitStateKind::HalfOpen);

        reg.record_success("api");
        reg.record_success("api");
        assert_eq!(reg.get_state("api").kind, CircuitStateKind::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_immediately() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        reg.record_failure("api");
        reg.record_failure("api");
        reg.record_failure("api");
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(reg.can_execute("api"));
        reg.record_failure("api");
        assert_eq!(reg.get_state("api").kind, CircuitStateKind::Open);
    }

    #[tokio::test]
    async fn execute_rejects_without_invoking_when_open() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        for _ in 0..3 {
            reg.record_failure("api");
        }
        let mut invoked = false;
        let result: Result<(), CircuitCallError<&str>> = reg
            .execute("api", || async {
                invoked = true;
                Ok(())
            })
            .await;
        assert!(!invoked);
        assert!(matches!(result, Err(CircuitCallError::Open(_))));
    }

    #[test]
    fn distinct_keys_have_independent_state() {
        let reg = CircuitBreakerRegistry::new(fast_config());
        reg.record_failure("a");
        reg.record_failure("a");
        reg.record_failure("a");
        assert_eq!(reg.get_state("a").kind, CircuitStateKind::Open);
        assert_eq!(reg.get_state("b").kind, CircuitStateKind::Closed);
    }

    #[test]
    fn failure_count_monotonic_until_success_in_closed_state() {
        let reg = CircuitBreakerRegistry::new(CircuitBreakerConfig { threshold: 100, ..fast_config() });
        let mut last = 0;
        for _ in 0..10 {
            reg.record_failure("k");
            let now = reg.get_state("k").failure_count;
            assert!(now >= last);
            last = now;
        }
    }

    proptest::proptest! {
        /// Circuit breaker monotonicity (distilled spec §8.4): in the closed
        /// state `failureCount` never decreases between successes, and the
        /// circuit opens exactly when `threshold` consecutive failures have
        /// been recorded with no intervening success.
        #[test]
        fn opens_exactly_at_threshold_consecutive_failures(threshold in 1u32..20, extra in 0u32..5) {
            let reg = CircuitBreakerRegistry::new(CircuitBreakerConfig {
                threshold,
                reset_timeout: Duration::from_secs(3600),
                success_threshold: 2,
            });
            for n in 1..threshold {
                reg.record_failure("k");
                proptest::prop_assert_eq!(reg.get_state("k").kind, CircuitStateKind::Closed);
                proptest::prop_assert_eq!(reg.get_state("k").failure_count, n);
            }
            reg.record_failure("k");
            proptest::prop_assert_eq!(reg.get_state("k").kind, CircuitStateKind::Open);

            // Further failures while open neither move the circuit nor grow
            // the failure count — it's latched until the reset timeout.
            for _ in 0..extra {
                reg.record_failure("k");
            }
            proptest::prop_assert_eq!(reg.get_state("k").kind, CircuitStateKind::Open);
            proptest::prop_assert_eq!(reg.get_state("k").failure_count, threshold);
        }
    }
}
