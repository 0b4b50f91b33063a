//! HTTP-facing error type: every handler returns `Result<_, ApiError>` and
//! this maps each variant onto the appropriate status code, matching the
//! layered error design the engine crate documents (`NodeError ->
//! EngineError -> ApiError`, converted to HTTP status at this boundary).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Engine(#[from] engine::EngineError),

    #[error(transparent)]
    Db(#[from] db::DbError),

    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("not found")]
    NotFound,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Engine(engine::EngineError::RunNotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Engine(engine::EngineError::UnknownWorkflow(_)) => StatusCode::NOT_FOUND,
            ApiError::Engine(engine::EngineError::AlreadyTerminal(_)) => StatusCode::CONFLICT,
            ApiError::Engine(
                engine::EngineError::DuplicateNodeId(_)
                | engine::EngineError::UnknownNodeReference { .. }
                | engine::EngineError::CycleDetected
                | engine::EngineError::UnreachableLoopTarget { .. }
                | engine::EngineError::UnknownPredicate(_)
                | engine::EngineError::CyclicOrUnreachableNodes(_),
            ) => StatusCode::BAD_REQUEST,
            ApiError::Db(db::DbError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::InvalidDefinition(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "unhandled api error");
        }

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
