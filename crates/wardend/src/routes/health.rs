//! Health check endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    nodename: String,
    uptime_secs: i64,
}

/// Basic health check (is the server running?)
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        nodename: state.nodename.clone(),
        uptime_secs: state.uptime_secs(),
    })
}

#[derive(Serialize)]
pub struct ReadyResponse {
    status: &'static str,
    store: bool,
    subscribers: usize,
}

/// Readiness check: not shutting down and the store answers
pub async fn ready_check(
    State(state): State<AppState>,
) -> Result<Json<ReadyResponse>, StatusCode> {
    if state.is_shutting_down() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    // `-` selects no object, the copy stays small
    match state.store.snapshot("-", "").await {
        Ok(_) => Ok(Json(ReadyResponse {
            status: "ready",
            store: true,
            subscribers: state.bus.subscriber_count(),
        })),
        Err(e) => {
            tracing::debug!(error = %e, "store not ready");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
