//! Human-approval gates: persists approval requests, blocks watchers until a
//! response arrives or a timeout fires, and supports delegation.
//!
//! A watcher registered after the response already exists must still be
//! notified, but on the *next* micro-cooperative step rather than
//! synchronously, to avoid re-entrancy if the caller is itself inside the
//! notify path — replicated here by always `tokio::spawn`-ing the
//! notification rather than calling the callback inline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
pub use crate::models::{ApprovalKind, TimeoutAction};

/// One link in a `chain`-type approval — a sequence of approvers who must
/// each sign off before the request resolves. Out of scope for v1's single
/// `submit_response` call: modeled here for the `Chain` kind's shape, but
/// chain advancement is left to the caller (re-`createRequest` the next
/// link after each response) rather than built into the store itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainLink {
    pub assignee: String,
    pub title: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub run_id: Uuid,
    pub node_id: String,
    pub kind: ApprovalKind,
    pub title: String,
    pub description: String,
    pub assignee: String,
    pub choices: Option<Vec<String>>,
    pub chain: Option<Vec<ChainLink>>,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: Option<u64>,
    pub timeout_action: Option<TimeoutAction>,
}

/// A decision value: boolean for approve/reject, string for multi-choice or
/// free-form, number for numeric-rating. `None` represents an
/// auto-generated `escalate` or a cancel-induced synthetic timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Decision {
    Bool(bool),
    Text(String),
    Number(f64),
    Null,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub request_id: Uuid,
    pub decision: Decision,
    pub responded_by: String,
    pub responded_at: DateTime<Utc>,
    pub comment: Option<String>,
    pub delegated_to: Option<String>,
    pub delegation_reason: Option<String>,
    /// Set on cancel-induced synthetic responses (§5 cancellation semantics).
    pub timed_out: bool,
}

struct PendingWatchers {
    request: ApprovalRequest,
    response: Option<ApprovalResponse>,
    watchers: Vec<Box<dyn FnOnce(ApprovalResponse) + Send>>,
}

/// Process-wide approval request/response registry. One instance is owned
/// by the manager and shared by reference across every executor.
#[derive(Default)]
pub struct ApprovalStore {
    entries: DashMap<Uuid, Arc<Mutex<PendingWatchers>>>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_request(&self, request: ApprovalRequest) -> Uuid {
        let id = request.id;
        info!(request_id = %id, assignee = %request.assignee, "approval request created");
        self.entries.insert(id, Arc::new(Mutex::new(PendingWatchers { request, response: None, watchers: Vec::new() })));
        id
    }

    pub fn get_pending_requests(&self, workflow_id: Option<Uuid>, assignee: Option<&str>) -> Vec<ApprovalRequest> {
        self.entries
            .iter()
            .filter_map(|e| {
                let guard = e.value().lock();
                if guard.response.is_some() {
                    return None;
                }
                if let Some(wf) = workflow_id {
                    if guard.request.workflow_id != wf {
                        return None;
                    }
                }
                if let Some(a) = assignee {
                    if guard.request.assignee != a {
                        return None;
                    }
                }
                Some(guard.request.clone())
            })
            .collect()
    }

    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        self.entries.get(&id).map(|e| e.lock().request.clone())
    }

    /// Atomically writes the response (a second call is rejected with
    /// `ApprovalAlreadyResolved`) and notifies every registered watcher.
    /// Watchers registered *after* this call but racing with it will never
    /// observe a torn state: the lock is held across the write.
    pub fn submit_response(&self, response: ApprovalResponse) -> Result<(), EngineError> {
        let entry = self.entries.get(&response.request_id).ok_or(EngineError::ApprovalRequestNotFound(response.request_id))?;
        let mut guard = entry.lock();
        if guard.response.is_some() {
            return Err(EngineError::ApprovalAlreadyResolved(response.request_id));
        }
        guard.response = Some(response.clone());
        let watchers = std::mem::take(&mut guard.watchers);
        drop(guard);

        for watcher in watchers {
            let response = response.clone();
            tokio::spawn(async move {
                watcher(response);
            });
        }
        Ok(())
    }

    /// Registers a callback invoked once the request resolves. If the
    /// request has already resolved, the callback still fires — but on the
    /// next cooperative scheduling step via `tokio::spawn`, never
    /// synchronously.
    pub fn on_response(&self, request_id: Uuid, cb: impl FnOnce(ApprovalResponse) + Send + 'static) -> Result<(), EngineError> {
        let entry = self.entries.get(&request_id).ok_or(EngineError::ApprovalRequestNotFound(request_id))?;
        let mut guard = entry.lock();
        if let Some(response) = guard.response.clone() {
            drop(guard);
            tokio::spawn(async move {
                cb(response);
            });
        } else {
            guard.watchers.push(Box::new(cb));
        }
        Ok(())
    }

    pub fn delete_request(&self, id: Uuid) {
        self.entries.remove(&id);
    }

    /// Rewrites a request's assignee to `delegated_to` and clears any prior
    /// response attempt, per the delegation wrapper: a response with
    /// `decision=null` and `delegated_to` set is reinterpreted as a
    /// reassignment rather than a resolution.
    pub fn delegate(&self, request_id: Uuid, delegated_to: String) -> Result<(), EngineError> {
        let entry = self.entries.get(&request_id).ok_or(EngineError::ApprovalRequestNotFound(request_id))?;
        let mut guard = entry.lock();
        guard.request.assignee = delegated_to;
        Ok(())
    }
}

/// Awaits a response on `request_id`, or returns a synthetic timed-out
/// response per `timeout_action` if `timeout_ms` elapses first (`Escalate`
/// never times out here — the caller is expected to emit an escalation
/// event and keep the request open; this awaits indefinitely in that case).
pub async fn await_response_or_timeout(
    store: &ApprovalStore,
    request_id: Uuid,
    timeout_ms: Option<u64>,
    timeout_action: Option<TimeoutAction>,
) -> ApprovalResponse {
    let (tx, rx) = tokio::sync::oneshot::channel();
    store
        .on_response(request_id, move |resp| {
            let _ = tx.send(resp);
        })
        .expect("request must exist");

    match timeout_ms {
        Some(ms) => {
            match tokio::time::timeout(std::time::Duration::from_millis(ms), rx).await {
                Ok(Ok(resp)) => resp,
                Ok(Err(_)) | Err(_) => {
                    // Timer fired (or the watcher's sender half was dropped
                    // along with the timed-out receiver). Auto-decide per
                    // `timeout_action`, unless
                    // it's `Escalate`, which has no auto-decision and is
                    // left for the caller to handle by emitting an event
                    // and re-awaiting with no timeout.
                    let decision = match timeout_action {
                        Some(TimeoutAction::Approve) => Decision::Bool(true),
                        Some(TimeoutAction::Reject) => Decision::Bool(false),
                        Some(TimeoutAction::Escalate) | None => Decision::Null,
                    };
                    ApprovalResponse {
                        request_id,
                        decision,
                        responded_by: "system:timeout".into(),
                        responded_at: Utc::now(),
                        comment: None,
                        delegated_to: None,
                        delegation_reason: None,
                        timed_out: true,
                    }
                }
            }
        }
        None => rx.await.unwrap_or(ApprovalResponse {
            request_id,
            decision: Decision::Null,
            responded_by: "system:channel_closed".into(),
            responded_at: Utc::now(),
            comment: None,
            delegated_to: None,
            delegation_reason: None,
            timed_out: true,
        }),
    }
}

#[async_trait]
pub trait ApprovalSink: Send + Sync {
    async fn create_request(&self, request: ApprovalRequest) -> Result<Uuid, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> ApprovalRequest {
        ApprovalRequest {
            id: Uuid::new_v4(),
            workflow_id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            node_id: "approve_refund".into(),
            kind: ApprovalKind::ApproveReject,
            title: "Approve refund".into(),
            description: "Refund $500".into(),
            assignee: "alice".into(),
            choices: None,
            chain: None,
            created_at: Utc::now(),
            timeout_ms: None,
            timeout_action: None,
        }
    }

    #[test]
    fn create_and_get_round_trips() {
        let store = ApprovalStore::new();
        let req = sample_request();
        let id = store.create_request(req.clone());
        assert_eq!(store.get(id).unwrap().assignee, "alice");
    }

    #[test]
    fn pending_requests_excludes_resolved() {
        let store = ApprovalStore::new();
        let req = sample_request();
        let id = store.create_request(req.clone());
        assert_eq!(store.get_pending_requests(None, None).len(), 1);

        store
            .submit_response(ApprovalResponse {
                request_id: id,
                decision: Decision::Bool(true),
                responded_by: "alice".into(),
                responded_at: Utc::now(),
                comment: None,
                delegated_to: None,
                delegation_reason: None,
                timed_out: false,
            })
            .unwrap();
        assert_eq!(store.get_pending_requests(None, None).len(), 0);
    }

    #[test]
    fn second_response_is_rejected() {
        let store = ApprovalStore::new();
        let req = sample_request();
        let id = store.create_request(req);
        let resp = |d: Decision| ApprovalResponse {
            request_id: id,
            decision: d,
            responded_by: "alice".into(),
            responded_at: Utc::now(),
            comment: None,
            delegated_to: None,
            delegation_reason: None,
            timed_out: false,
        };
        store.submit_response(resp(Decision::Bool(true))).unwrap();
        let second = store.submit_response(resp(Decision::Bool(false)));
        assert!(matches!(second, Err(EngineError::ApprovalAlreadyResolved(_))));
    }

    #[tokio::test]
    async fn watcher_registered_before_response_is_notified() {
        let store = ApprovalStore::new();
        let req = sample_request();
        let id = store.create_request(req);

        let resp = await_response_or_timeout(&store, id, None, None);
        let submit = async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            store
                .submit_response(ApprovalResponse {
                    request_id: id,
                    decision: Decision::Bool(true),
                    responded_by: "alice".into(),
                    responded_at: Utc::now(),
                    comment: None,
                    delegated_to: None,
                    delegation_reason: None,
                    timed_out: false,
                })
                .unwrap();
        };

        let (response, _) = tokio::join!(resp, submit);
        assert_eq!(response.decision, Decision::Bool(true));
    }

    #[tokio::test]
    async fn late_watcher_on_already_resolved_request_still_fires() {
        let store = ApprovalStore::new();
        let req = sample_request();
        let id = store.create_request(req);
        store
            .submit_response(ApprovalResponse {
                request_id: id,
                decision: Decision::Bool(true),
                responded_by: "alice".into(),
                responded_at: Utc::now(),
                comment: None,
                delegated_to: None,
                delegation_reason: None,
                timed_out: false,
            })
            .unwrap();

        let response = await_response_or_timeout(&store, id, None, None).await;
        assert_eq!(response.decision, Decision::Bool(true));
    }

    #[tokio::test]
    async fn timeout_fires_auto_decision() {
        let store = ApprovalStore::new();
        let req = sample_request();
        let id = store.create_request(req);

        let response = await_response_or_timeout(&store, id, Some(10), Some(TimeoutAction::Reject)).await;
        assert_eq!(response.decision, Decision::Bool(false));
        assert!(response.timed_out);
    }

    #[tokio::test]
    async fn escalate_timeout_yields_null_decision_and_keeps_request_open() {
        let store = ApprovalStore::new();
        let req = sample_request();
        let id = store.create_request(req);

        let response = await_response_or_timeout(&store, id, Some(10), Some(TimeoutAction::Escalate)).await;
        assert_eq!(response.decision, Decision::Null);
        assert!(store.get(id).is_some(), "request is not deleted on escalate");
    }

    #[test]
    fn delegate_rewrites_assignee() {
        let store = ApprovalStore::new();
        let req = sample_request();
        let id = store.create_request(req);
        store.delegate(id, "bob".into()).unwrap();
        assert_eq!(store.get(id).unwrap().assignee, "bob");
    }
}
