//! HTTP API routes for the session orchestrator
//!
//! Every session route resolves its `(owner_id, session_id)` pair to one
//! SessionActor through the registry and forwards a single message.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;

pub mod sessions;

use crate::registry::SessionRegistry;

#[derive(Clone)]
pub struct ApiState {
    pub registry: SessionRegistry,
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/sessions/{owner_id}/{session_id}/prepare",
            put(sessions::prepare_session),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions/start",
            post(sessions::start_execution),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions",
            post(sessions::enqueue_execution),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions/{execution_id}",
            get(sessions::get_execution),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions/{execution_id}/status",
            post(sessions::update_execution_status),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions/{execution_id}/complete",
            post(sessions::complete_execution),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions/{execution_id}/cancel",
            post(sessions::cancel_execution),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions/{execution_id}/lease",
            post(sessions::acquire_lease),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions/{execution_id}/lease/extend",
            post(sessions::extend_lease),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/executions/{execution_id}/lease/release",
            post(sessions::release_lease),
        )
        .route(
            "/sessions/{owner_id}/{session_id}/queue",
            get(sessions::queue_snapshot),
        )
}

/// Health check endpoint
pub async fn health_check(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "session-orchestrator",
            "version": env!("CARGO_PKG_VERSION"),
            "activeSessions": state.registry.active_sessions(),
        })),
    )
}
