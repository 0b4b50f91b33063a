use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use db::repository::workflows as wf_repo;
use engine::{TriggerKind, Workflow};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::{ApiError, AppState};

#[derive(serde::Deserialize)]
pub struct CreateWorkflowDto {
    pub name: String,
    pub definition: Value,
}

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<db::models::WorkflowRow>>, ApiError> {
    Ok(Json(wf_repo::list_workflows(&state.pool).await?))
}

pub async fn get(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<db::models::WorkflowRow>, ApiError> {
    Ok(Json(wf_repo::get_workflow(&state.pool, id).await?))
}

/// Registers a freshly-created (or re-registered) workflow with the
/// manager and, per its `TriggerKind`, with the matching trigger
/// dispatcher — mirroring how `Manager::register_workflow` alone is
/// enough for `Manual`, but `Webhook`/`Cron`/`Event` also need an entry
/// in the dispatcher that fires into the manager.
fn register_triggers(state: &AppState, wf: &Workflow) -> Result<(), ApiError> {
    state.manager.register_workflow(wf.clone());
    match &wf.trigger {
        TriggerKind::Manual => {}
        TriggerKind::Webhook { path } => {
            state.triggers.webhook.register(wf.name.clone(), "POST", path.clone(), None, None, None, Duration::from_secs(0), vec![]);
        }
        TriggerKind::Cron { expression } => {
            state
                .triggers
                .cron
                .register(wf.name.clone(), expression, 1, vec![], chrono::Utc::now())
                .map_err(|e| ApiError::InvalidDefinition(e.to_string()))?;
        }
        TriggerKind::Event { event_type } => {
            state.triggers.event.subscribe(wf.name.clone(), event_type.clone(), None, None, vec![]);
        }
    }
    Ok(())
}

pub async fn create(State(state): State<AppState>, Json(payload): Json<CreateWorkflowDto>) -> Result<(StatusCode, Json<db::models::WorkflowRow>), ApiError> {
    let wf: Workflow = serde_json::from_value(payload.definition.clone()).map_err(|e| ApiError::InvalidDefinition(e.to_string()))?;

    let row = wf_repo::create_workflow(&state.pool, &payload.name, payload.definition).await?;
    register_triggers(&state, &wf)?;

    Ok((StatusCode::CREATED, Json(row)))
}

pub async fn delete(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    wf_repo::delete_workflow(&state.pool, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
