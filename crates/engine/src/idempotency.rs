//! Content-addressed memoisation of node results.
//!
//! Keys are a non-cryptographic 64-bit hash of `(workflow, node, canonical
//! input)` — acceptable given the bounded TTL, and nothing else in this
//! codebase's dependency tree pulls in a hashing crate for non-secret use,
//! so `std::hash::DefaultHasher` is the right, dependency-free tool.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use nodes::NodeError;

/// A stable error representation, because `NodeError` itself is not
/// `Serialize`; idempotency records must be able to replay a stored
/// failure exactly as they replay a stored success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredError {
    pub kind: String,
    pub message: String,
}

impl From<&NodeError> for StoredError {
    fn from(e: &NodeError) -> Self {
        Self { kind: e.name().to_owned(), message: e.to_string() }
    }
}

impl From<StoredError> for NodeError {
    fn from(e: StoredError) -> Self {
        match e.kind.as_str() {
            "Retryable" => NodeError::Retryable(e.message),
            "Timeout" => NodeError::Timeout(e.message),
            "CircuitBreakerOpenError" => NodeError::CircuitOpen(e.message),
            "Cancelled" => NodeError::Cancelled,
            _ => NodeError::Fatal(e.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result: Result<Value, StoredError>,
    pub created_at: i64,
    pub expires_at: i64,
}

/// Compute the stable hex digest key for `(workflow, node, input)`.
/// `serde_json::Value`'s `Hash` impl (via its `Eq`/total order on maps) is
/// not defined, so we hash the canonical serialised string instead —
/// `serde_json` already serialises object keys in a deterministic
/// (insertion, but BTreeMap-backed-when-compiled-with-preserve_order-off)
/// order, which is stable enough for memoisation purposes here since both
/// sides of a comparison go through the same serialiser.
pub fn compute_key(workflow_name: &str, node_id: &str, input: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    workflow_name.hash(&mut hasher);
    0u8.hash(&mut hasher); // separator to avoid "ab"+"c" == "a"+"bc" collisions
    node_id.hash(&mut hasher);
    hasher.write_u8(0);
    let canonical = serde_json::to_string(input).unwrap_or_default();
    canonical.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

/// Outcome of a `check`.
pub struct CheckResult {
    pub is_duplicate: bool,
    pub record: Option<IdempotencyRecord>,
}

/// In-memory, TTL-bounded idempotency store. One instance is shared across
/// all executors in a process (per Design Notes §9: a process-wide service
/// owned by the manager).
#[derive(Default)]
pub struct IdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl IdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str) -> CheckResult {
        match self.records.get(key) {
            Some(entry) if entry.expires_at > now_ms() => {
                CheckResult { is_duplicate: true, record: Some(entry.clone()) }
            }
            _ => CheckResult { is_duplicate: false, record: None },
        }
    }

    /// Writes a result (success or the stringified failure), overwriting
    /// any prior entry — the underlying operation is assumed deterministic,
    /// so last-writer-wins is correct.
    pub fn store(&self, key: &str, result: Result<Value, StoredError>, ttl: Duration) {
        let created_at = now_ms();
        self.records.insert(
            key.to_owned(),
            IdempotencyRecord { key: key.to_owned(), result, created_at, expires_at: created_at + ttl.as_millis() as i64 },
        );
    }

    pub fn sweep_expired(&self) {
        let now = now_ms();
        self.records.retain(|_, v| v.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Runs `f` under idempotency memoisation: a cache hit within TTL returns
/// (or rethrows) the stored result without invoking `f`; a miss calls `f`
/// once and stores its outcome — success or failure — before returning it.
pub async fn idempotent<F, Fut>(store: &IdempotencyStore, key: &str, ttl: Duration, f: F) -> Result<Value, NodeError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value, NodeError>>,
{
    if let CheckResult { is_duplicate: true, record: Some(rec) } = store.check(key) {
        return rec.result.map_err(NodeError::from);
    }

    let outcome = f().await;
    let stored = match &outcome {
        Ok(v) => Ok(v.clone()),
        Err(e) => Err(StoredError::from(e)),
    };
    store.store(key, stored, ttl);
    outcome
}
