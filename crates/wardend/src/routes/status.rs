//! Cluster status endpoint.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use warden_common::ClusterStatus;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct StatusQuery {
    /// Comma-separated object path globs
    #[serde(default)]
    selector: String,
    #[serde(default)]
    namespace: String,
}

/// Filtered copy of the cluster tree
pub async fn daemon_status(
    State(state): State<AppState>,
    Query(params): Query<StatusQuery>,
) -> Result<Json<ClusterStatus>, StatusCode> {
    state
        .store
        .snapshot(&params.selector, &params.namespace)
        .await
        .map(Json)
        .map_err(|e| {
            tracing::warn!(error = %e, "snapshot failed");
            StatusCode::SERVICE_UNAVAILABLE
        })
}
