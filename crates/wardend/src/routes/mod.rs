//! HTTP route handlers for the daemon.

use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

mod health;
mod object;
mod status;

/// Create the daemon router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health & Status
        .route("/health", get(health::health_check))
        .route("/ready", get(health::ready_check))
        .route("/daemon/status", get(status::daemon_status))

        // Operator requests, relayed to the instance monitors
        .route("/object/abort", post(object::abort))
        .route("/object/clear", post(object::clear))

        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
