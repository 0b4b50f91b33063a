use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use serde_json::{json, Value};
use triggers::{WebhookOutcome, WebhookRequest};

use crate::AppState;

fn headers_to_map(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_lowercase(), v.to_string())))
        .collect()
}

/// Dispatches an inbound `POST /webhook/*path` through
/// `TriggerDispatcher::webhook`, which runs auth, rate-limiting, payload
/// validation, and dedup before firing into the manager (§4.I).
pub async fn handle_webhook(
    Path(path): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let req = WebhookRequest {
        method: "POST".to_string(),
        path: format!("/{path}"),
        headers: headers_to_map(&headers),
        body: payload,
    };

    match state.triggers.webhook.handle(req, state.manager.as_ref()).await {
        None => (StatusCode::NOT_FOUND, Json(json!({ "error": "no trigger registered for this path" }))),
        Some(WebhookOutcome::Triggered { trigger_id, run_id }) => {
            (StatusCode::ACCEPTED, Json(json!({ "run_id": run_id, "trigger_id": trigger_id })))
        }
        Some(WebhookOutcome::Deduplicated) => (StatusCode::OK, Json(json!({ "triggered": false, "reason": "deduplicated" }))),
        Some(WebhookOutcome::ValidationFailed) => (StatusCode::BAD_REQUEST, Json(json!({ "error": "payload validation failed" }))),
        Some(WebhookOutcome::AuthFailed) => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "authentication failed" }))),
        Some(WebhookOutcome::RateLimited { retry_after_ms }) => {
            (StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "rate limited", "retry_after_ms": retry_after_ms })))
        }
    }
}
