//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health`: liveness probe.
///
/// Returns status, uptime, version, and a one-line summary of the session,
/// directory, and speech bridge. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let bridge = &state.bridge;
    let session = bridge.session().status();

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "session": session.state,
        "running": session.running,
        "servers": bridge.directory().servers().len(),
        "pending_completions": bridge.speech().pending_completions(),
    }))
}
