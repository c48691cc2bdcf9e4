//! HTTP route handlers.
//!
//! Each sub-module corresponds to an API endpoint group. All handlers except
//! [`health`] require authentication via the [`crate::auth::require_api_key`]
//! middleware.

pub mod health;
pub mod servers;
pub mod session;
pub mod shell;
pub mod speech;
pub mod targets;

use axum::{
    http::StatusCode,
    middleware,
    routing::{get, post, put},
    Extension, Json, Router,
};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::AppState;

/// Error half of every fallible handler.
pub type ApiError = (StatusCode, Json<Value>);

pub(crate) fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (status, Json(json!({"error": message.into(), "code": code})))
}

/// Build the full router with authentication and request tracing.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/session", get(session::status))
        .route("/api/session/start", post(session::start))
        .route("/api/session/permission", post(session::permission))
        .route("/api/session/stop", post(session::stop))
        .route("/api/shell/targets", post(shell::open_targets))
        .route("/api/shell/servers", post(shell::open_servers))
        .route("/api/shell/open", post(shell::open_url))
        .route("/api/speech", post(speech::speak))
        .route("/api/speech/voices", get(speech::voices))
        .route("/api/speech/done", get(speech::done))
        .route("/api/servers", get(servers::list))
        .route("/api/servers/events", get(servers::events))
        .route("/api/servers/refresh", post(servers::refresh))
        .route("/api/servers/selected", put(servers::select))
        .route("/api/targets", get(targets::list))
        .route("/api/targets/{id}", put(targets::set_included))
        .layer(middleware::from_fn(auth::require_api_key));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
