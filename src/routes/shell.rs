//! Endpoints that open user-facing surfaces.
//!
//! - `POST /api/shell/targets`: target-selection surface
//! - `POST /api/shell/servers`: server directory surface (also refreshes)
//! - `POST /api/shell/open`: open an external URL

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ApiError};
use crate::AppState;

pub async fn open_targets(State(state): State<AppState>) -> Json<Value> {
    state.bridge.configure_targets();
    Json(json!({"opened": "targets"}))
}

pub async fn open_servers(State(state): State<AppState>) -> Json<Value> {
    state.bridge.select_server_screen();
    Json(json!({"opened": "servers"}))
}

#[derive(Deserialize)]
pub struct OpenUrlBody {
    pub url: String,
}

/// Answers `400 OPEN_FAILED` when the shell refuses the URL.
pub async fn open_url(
    State(state): State<AppState>,
    Json(body): Json<OpenUrlBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .bridge
        .open_url(&body.url)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, "OPEN_FAILED", e))?;
    Ok(Json(json!({"opened": body.url})))
}
