//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::bridge::Bridge;
use crate::config::Config;

/// Shared application state for the surfbridge daemon.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the daemon started (for uptime calculation).
    pub start_time: Instant,
    /// The control surface: session, directory, targets, speech.
    pub bridge: Arc<Bridge>,
}
