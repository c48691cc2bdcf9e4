//! Allowed-target endpoints.
//!
//! - `GET /api/targets?show_system=bool`: installed targets with inclusion
//! - `PUT /api/targets/{id}`: body `{"included": bool}`

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ApiError};
use crate::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub show_system: bool,
}

pub async fn list(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Json<Value> {
    Json(json!({
        "targets": state.bridge.target_entries(query.show_system),
        "included": state.bridge.targets().included(),
    }))
}

#[derive(Deserialize)]
pub struct IncludeBody {
    pub included: bool,
}

/// Answers `500 STORE_FAILED` when the change could not be persisted; the
/// set is unchanged in that case. The store writes synchronously, so the
/// change runs on the blocking pool.
pub async fn set_included(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<IncludeBody>,
) -> Result<Json<Value>, ApiError> {
    let bridge = Arc::clone(&state.bridge);
    let target = id.clone();
    let included = body.included;
    tokio::task::spawn_blocking(move || bridge.set_target_included(&target, included))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", e.to_string()))?
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "STORE_FAILED", e.to_string()))?;
    Ok(Json(json!({"id": id, "included": included})))
}
