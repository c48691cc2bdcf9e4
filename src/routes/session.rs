//! Tunnel session endpoints.
//!
//! - `GET /api/session`: current state
//! - `POST /api/session/start`: bring the tunnel up
//! - `POST /api/session/permission`: deliver the user's permission answer
//! - `POST /api/session/stop`: tear the tunnel down
//!
//! Start and stop call into the platform and engine synchronously, so they
//! run on the blocking pool.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ApiError};
use crate::error::SessionError;
use crate::session::StartOutcome;
use crate::AppState;

/// `GET /api/session`
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!(state.bridge.session().status()))
}

/// `POST /api/session/start`
///
/// # Responses
///
/// - `200` with `{"outcome": "started" | "already_running" | "in_progress" | "cancelled"}`
/// - `202` with `{"outcome": "permission_required", "request": {...}}`
/// - `502` with `{"code": "ESTABLISHMENT_FAILED" | "ENGINE_FAILED"}`
pub async fn start(State(state): State<AppState>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let bridge = Arc::clone(&state.bridge);
    let outcome = tokio::task::spawn_blocking(move || bridge.start_session())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string()))?
        .map_err(session_error)?;

    let reply = match outcome {
        StartOutcome::PermissionRequired(request) => {
            return Ok((
                StatusCode::ACCEPTED,
                Json(json!({"outcome": "permission_required", "request": request})),
            ))
        }
        StartOutcome::Started => "started",
        StartOutcome::AlreadyRunning => "already_running",
        StartOutcome::InProgress => "in_progress",
        StartOutcome::Cancelled => "cancelled",
    };
    Ok((StatusCode::OK, Json(json!({"outcome": reply}))))
}

#[derive(Deserialize)]
pub struct PermissionBody {
    pub granted: bool,
}

/// `POST /api/session/permission`, body `{"granted": bool}`.
///
/// A denial answers `403 PERMISSION_DENIED`.
pub async fn permission(
    State(state): State<AppState>,
    Json(body): Json<PermissionBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .bridge
        .permission_result(body.granted)
        .map_err(session_error)?;
    Ok(Json(json!({"granted": true})))
}

/// `POST /api/session/stop`: always succeeds.
pub async fn stop(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let bridge = Arc::clone(&state.bridge);
    tokio::task::spawn_blocking(move || bridge.stop_session())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string()))?;
    Ok(Json(json!({"stopped": true})))
}

fn session_error(e: SessionError) -> ApiError {
    let status = match e {
        SessionError::PermissionDenied => StatusCode::FORBIDDEN,
        SessionError::Establishment(_) | SessionError::EngineInvocation(_) => {
            StatusCode::BAD_GATEWAY
        }
    };
    api_error(status, e.code(), e.to_string())
}
