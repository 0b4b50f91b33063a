//! `api` crate — HTTP REST API layer.
//!
//! Exposes:
//!   GET    /api/v1/workflows
//!   POST   /api/v1/workflows
//!   GET    /api/v1/workflows/:id
//!   DELETE /api/v1/workflows/:id
//!   POST   /api/v1/workflows/:id/execute    (blocks until the run is terminal)
//!   POST   /api/v1/workflows/:id/schedule   (enqueues, returns immediately)
//!   GET    /api/v1/runs
//!   GET    /api/v1/runs/:id
//!   POST   /api/v1/runs/:id/pause
//!   POST   /api/v1/runs/:id/resume
//!   POST   /api/v1/runs/:id/cancel
//!   POST   /api/v1/runs/:id/retry
//!   POST   /webhook/*path

pub mod error;
pub mod handlers;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use db::DbPool;
use engine::manager::Manager;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use triggers::TriggerDispatcher;

pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub manager: Arc<Manager>,
    pub triggers: Arc<TriggerDispatcher>,
}

pub async fn serve(bind: &str, pool: DbPool, manager: Arc<Manager>, triggers: Arc<TriggerDispatcher>) -> Result<(), std::io::Error> {
    let state = AppState { pool, manager, triggers };

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let api_router = Router::new()
        .route("/workflows", get(handlers::workflows::list).post(handlers::workflows::create))
        .route("/workflows/:id", get(handlers::workflows::get).delete(handlers::workflows::delete))
        .route("/workflows/:id/execute", post(handlers::runs::execute))
        .route("/workflows/:id/schedule", post(handlers::runs::schedule))
        .route("/runs", get(handlers::runs::list))
        .route("/runs/:id", get(handlers::runs::get))
        .route("/runs/:id/pause", post(handlers::runs::pause))
        .route("/runs/:id/resume", post(handlers::runs::resume))
        .route("/runs/:id/cancel", post(handlers::runs::cancel))
        .route("/runs/:id/retry", post(handlers::runs::retry));

    let app = Router::new()
        .nest("/api/v1", api_router)
        .route("/webhook/*path", post(handlers::webhooks::handle_webhook))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await
}
