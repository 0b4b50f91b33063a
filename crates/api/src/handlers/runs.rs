use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use db::repository::workflows as wf_repo;
use engine::{RunFilter, RunRecord, RunStatus, Workflow};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::{ApiError, AppState};

async fn load_workflow(state: &AppState, id: Uuid) -> Result<Workflow, ApiError> {
    let row = wf_repo::get_workflow(&state.pool, id).await?;
    serde_json::from_value(row.definition).map_err(|e| ApiError::InvalidDefinition(e.to_string()))
}

#[derive(Deserialize, Default)]
pub struct RunStartDto {
    pub state_patch: Option<Value>,
    pub priority: Option<i32>,
    pub at: Option<i64>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Blocks until the run reaches a terminal status. Body may be `{}`.
pub async fn execute(Path(id): Path<Uuid>, State(state): State<AppState>, Json(dto): Json<RunStartDto>) -> Result<Json<RunRecord>, ApiError> {
    let wf = load_workflow(&state, id).await?;
    let run = state.manager.execute(wf, dto.state_patch).await?;
    Ok(Json(run))
}

/// Enqueues the run and returns immediately with its id. Body may be `{}`.
pub async fn schedule(Path(id): Path<Uuid>, State(state): State<AppState>, Json(dto): Json<RunStartDto>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let wf = load_workflow(&state, id).await?;
    let run_id = state
        .manager
        .schedule(
            wf,
            engine::manager::ScheduleOptions { at: dto.at, priority: dto.priority, tags: dto.tags, state_patch: dto.state_patch },
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "run_id": run_id }))))
}

#[derive(Deserialize, Default)]
pub struct ListRunsQuery {
    pub workflow_name: Option<String>,
    pub status: Option<String>,
    pub tag: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn list(State(state): State<AppState>, Query(q): Query<ListRunsQuery>) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let status = match q.status.as_deref() {
        Some(s) => vec![parse_status(s)?],
        None => vec![],
    };
    let filter = RunFilter {
        workflow_name: q.workflow_name,
        status,
        tags: q.tag.into_iter().collect(),
        limit: q.limit,
        offset: q.offset,
        ..Default::default()
    };
    Ok(Json(state.manager.list_runs(&filter).await?))
}

fn parse_status(s: &str) -> Result<RunStatus, ApiError> {
    match s.to_lowercase().as_str() {
        "pending" => Ok(RunStatus::Pending),
        "running" => Ok(RunStatus::Running),
        "paused" => Ok(RunStatus::Paused),
        "completed" => Ok(RunStatus::Completed),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" | "canceled" => Ok(RunStatus::Cancelled),
        other => Err(ApiError::InvalidDefinition(format!("unknown run status '{other}'"))),
    }
}

pub async fn get(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<RunRecord>, ApiError> {
    state.manager.get_status(id).await?.map(Json).ok_or(ApiError::NotFound)
}

pub async fn pause(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.manager.pause(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn resume(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.manager.resume(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize, Default)]
pub struct CancelDto {
    pub reason: Option<String>,
}

pub async fn cancel(Path(id): Path<Uuid>, State(state): State<AppState>, body: Option<Json<CancelDto>>) -> Result<StatusCode, ApiError> {
    let dto = body.map(|Json(d)| d).unwrap_or_default();
    state.manager.cancel(id, dto.reason).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn retry(Path(id): Path<Uuid>, State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let run_id = state.manager.retry(id).await?;
    Ok(Json(serde_json::json!({ "run_id": run_id })))
}
