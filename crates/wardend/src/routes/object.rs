//! Operator requests on the local instance monitors.

use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use warden_common::constants::labels;
use warden_common::{GlobalExpect, MonitorState, MonitorUpdate, ObjectPath, WardenError};

use crate::bus::{Event, Label};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct ObjectRequest {
    path: String,
}

#[derive(Serialize)]
pub struct ObjectResponse {
    path: String,
    node: String,
}

/// Set the global expect of the local instance to `aborted`
pub async fn abort(
    State(state): State<AppState>,
    Json(payload): Json<ObjectRequest>,
) -> Result<Json<ObjectResponse>, StatusCode> {
    request(&state, &payload.path, MonitorUpdate {
        global_expect: Some(GlobalExpect::Aborted),
        state: None,
    })
}

/// Reset the local instance monitor state to `idle`
pub async fn clear(
    State(state): State<AppState>,
    Json(payload): Json<ObjectRequest>,
) -> Result<Json<ObjectResponse>, StatusCode> {
    request(&state, &payload.path, MonitorUpdate {
        global_expect: None,
        state: Some(MonitorState::Idle),
    })
}

fn request(state: &AppState, path: &str, value: MonitorUpdate) -> Result<Json<ObjectResponse>, StatusCode> {
    if state.is_shutting_down() {
        return Err(reject(WardenError::ShuttingDown));
    }
    let path = ObjectPath::parse(path).map_err(reject)?;

    tracing::info!(path = %path, update = ?value, "monitor request");
    state.bus.publish(
        Event::SetInstanceMonitor {
            path: path.clone(),
            node: state.nodename.clone(),
            value,
        },
        &[Label::path(&path), Label::node(&state.nodename), Label::new(labels::FROM, "api")],
    );

    Ok(Json(ObjectResponse {
        path: path.to_string(),
        node: state.nodename.clone(),
    }))
}

fn reject(e: WardenError) -> StatusCode {
    tracing::debug!(error = %e, "rejected monitor request");
    StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}
