//! Webhook triggers: registered by `(method, path)`, fired through a common
//! pipeline of authentication, rate limiting, payload validation, and
//! dedup.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use queue::TokenBucketLimiter;
use serde_json::Value;
use tokio::time::Instant;
use uuid::Uuid;

use crate::sink::{FireContext, FireSink, TriggerType};

/// An incoming HTTP request, decoupled from any specific web framework —
/// the `api` crate maps an axum `Request` into this before calling
/// [`WebhookDispatcher::handle`].
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
}

/// Supported authentication schemes.
#[derive(Clone)]
pub enum WebhookAuth {
    Bearer { token: String },
    ApiKey { header: String, key: String },
}

impl WebhookAuth {
    fn check(&self, headers: &HashMap<String, String>) -> bool {
        match self {
            WebhookAuth::Bearer { token } => headers
                .get("authorization")
                .map(|v| v == &format!("Bearer {token}"))
                .unwrap_or(false),
            WebhookAuth::ApiKey { header, key } => headers
                .get(&header.to_lowercase())
                .map(|v| v == key)
                .unwrap_or(false),
        }
    }
}

type Validator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
type Transform = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// A registered webhook endpoint.
pub struct WebhookTrigger {
    pub id: Uuid,
    pub workflow_name: String,
    pub method: String,
    pub path: String,
    pub auth: Option<WebhookAuth>,
    pub validator: Option<Validator>,
    pub transform: Option<Transform>,
    pub dedup_window: Duration,
    pub tags: Vec<String>,
    enabled: AtomicBool,
    run_count: AtomicU64,
    recent_hashes: Mutex<VecDeque<(u64, Instant)>>,
}

/// What happened to a single inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Triggered { trigger_id: Uuid, run_id: Uuid },
    Deduplicated,
    ValidationFailed,
    AuthFailed,
    RateLimited { retry_after_ms: u64 },
}

fn payload_hash(payload: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    payload.to_string().hash(&mut hasher);
    hasher.finish()
}

/// Registry + dispatch pipeline for webhook-triggered workflows.
pub struct WebhookDispatcher {
    entries: DashMap<(String, String), Arc<WebhookTrigger>>,
    limiter: Option<Arc<TokenBucketLimiter>>,
}

impl WebhookDispatcher {
    pub fn new(limiter: Option<Arc<TokenBucketLimiter>>) -> Self {
        Self {
            entries: DashMap::new(),
            limiter,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &self,
        workflow_name: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        auth: Option<WebhookAuth>,
        validator: Option<Validator>,
        transform: Option<Transform>,
        dedup_window: Duration,
        tags: Vec<String>,
    ) -> Uuid {
        let method = method.into().to_uppercase();
        let path = path.into();
        let id = Uuid::new_v4();
        self.entries.insert(
            (method.clone(), path.clone()),
            Arc::new(WebhookTrigger {
                id,
                workflow_name: workflow_name.into(),
                method,
                path,
                auth,
                validator,
                transform,
                dedup_window,
                tags,
                enabled: AtomicBool::new(true),
                run_count: AtomicU64::new(0),
                recent_hashes: Mutex::new(VecDeque::new()),
            }),
        );
        id
    }

    pub fn set_enabled(&self, method: &str, path: &str, enabled: bool) {
        if let Some(entry) = self.entries.get(&(method.to_uppercase(), path.to_owned())) {
            entry.enabled.store(enabled, Ordering::Release);
        }
    }

    /// `(total, enabled)` across every registered webhook trigger, for
    /// `TriggerDispatcher::stats`.
    pub fn counts(&self) -> (usize, usize) {
        let total = self.entries.len();
        let enabled = self.entries.iter().filter(|e| e.enabled.load(Ordering::Acquire)).count();
        (total, enabled)
    }

    /// Returns `None` when no trigger matches `(method, path)` — the caller
    /// (the `api` crate) should respond 404 in that case.
    pub async fn handle(
        &self,
        req: WebhookRequest,
        sink: &dyn FireSink,
    ) -> Option<WebhookOutcome> {
        let key = (req.method.to_uppercase(), req.path.clone());
        let trigger = self.entries.get(&key)?.clone();

        if !trigger.enabled.load(Ordering::Acquire) {
            return None;
        }

        if let Some(auth) = &trigger.auth {
            if !auth.check(&req.headers) {
                return Some(WebhookOutcome::AuthFailed);
            }
        }

        if let Some(limiter) = &self.limiter {
            let decision = limiter.consume(&trigger.path, 1.0);
            if !decision.allowed {
                return Some(WebhookOutcome::RateLimited {
                    retry_after_ms: decision
                        .retry_after
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                });
            }
        }

        if let Some(validator) = &trigger.validator {
            if !validator(&req.body) {
                return Some(WebhookOutcome::ValidationFailed);
            }
        }

        let hash = payload_hash(&req.body);
        {
            let now = Instant::now();
            let mut recent = trigger.recent_hashes.lock();
            while matches!(recent.front(), Some((_, t)) if now.saturating_duration_since(*t) > trigger.dedup_window) {
                recent.pop_front();
            }
            if recent.iter().any(|(h, _)| *h == hash) {
                return Some(WebhookOutcome::Deduplicated);
            }
            recent.push_back((hash, now));
        }

        let payload = match &trigger.transform {
            Some(f) => f(req.body),
            None => req.body,
        };

        let ctx = FireContext {
            trigger_id: trigger.id,
            trigger_type: TriggerType::Webhook,
            payload,
            tags: trigger.tags.clone(),
            next_fire_at: None,
        };

        match sink.fire(&trigger.workflow_name, ctx).await {
            Ok(run_id) => {
                trigger.run_count.fetch_add(1, Ordering::AcqRel);
                Some(WebhookOutcome::Triggered {
                    trigger_id: trigger.id,
                    run_id,
                })
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TriggerError;
    use async_trait::async_trait;

    struct AlwaysFire;

    #[async_trait]
    impl FireSink for AlwaysFire {
        async fn fire(&self, _workflow_name: &str, _ctx: FireContext) -> Result<Uuid, TriggerError> {
            Ok(Uuid::new_v4())
        }
    }

    fn req(body: Value) -> WebhookRequest {
        WebhookRequest {
            method: "POST".into(),
            path: "/hook".into(),
            headers: HashMap::new(),
            body,
        }
    }

    #[tokio::test]
    async fn unregistered_path_returns_none() {
        let dispatcher = WebhookDispatcher::new(None);
        let outcome = dispatcher.handle(req(Value::Null), &AlwaysFire).await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn duplicate_payload_within_window_is_deduplicated() {
        let dispatcher = WebhookDispatcher::new(None);
        dispatcher.register(
            "wf",
            "POST",
            "/hook",
            None,
            None,
            None,
            Duration::from_secs(60),
            vec![],
        );

        let body = serde_json::json!({"order_id": 42});
        let first = dispatcher.handle(req(body.clone()), &AlwaysFire).await;
        let second = dispatcher.handle(req(body), &AlwaysFire).await;

        assert!(matches!(first, Some(WebhookOutcome::Triggered { .. })));
        assert_eq!(second, Some(WebhookOutcome::Deduplicated));
    }

    #[tokio::test]
    async fn auth_failure_is_reported_before_firing() {
        let dispatcher = WebhookDispatcher::new(None);
        dispatcher.register(
            "wf",
            "POST",
            "/secure",
            Some(WebhookAuth::Bearer { token: "secret".into() }),
            None,
            None,
            Duration::from_secs(1),
            vec![],
        );

        let mut r = req(Value::Null);
        r.path = "/secure".into();
        let outcome = dispatcher.handle(r, &AlwaysFire).await;
        assert_eq!(outcome, Some(WebhookOutcome::AuthFailed));
    }

    #[tokio::test]
    async fn validator_rejects_malformed_payload() {
        let dispatcher = WebhookDispatcher::new(None);
        dispatcher.register(
            "wf",
            "POST",
            "/validated",
            None,
            Some(Arc::new(|v: &Value| v.get("required_field").is_some())),
            None,
            Duration::from_secs(1),
            vec![],
        );

        let mut r = req(serde_json::json!({}));
        r.path = "/validated".into();
        let outcome = dispatcher.handle(r, &AlwaysFire).await;
        assert_eq!(outcome, Some(WebhookOutcome::ValidationFailed));
    }
}
