//! Error taxonomy for the control surface.
//!
//! Collaborators (engine, platform, speech engine) report failures as plain
//! messages; the core wraps them into these enums before they reach a caller.
//! Teardown never produces an error; those failures are logged and dropped.

use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the tunnel session controller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The user declined the privileged-tunnel permission request.
    #[error("permission for the privileged tunnel was denied")]
    PermissionDenied,
    /// The platform refused to create the tunnel interface.
    #[error("failed to establish tunnel: {0}")]
    Establishment(String),
    /// The engine rejected the tunnel descriptor after it was handed over.
    #[error("engine failed to start on the tunnel: {0}")]
    EngineInvocation(String),
}

impl SessionError {
    /// Stable machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Establishment(_) => "ESTABLISHMENT_FAILED",
            Self::EngineInvocation(_) => "ENGINE_FAILED",
        }
    }
}

/// Failures surfaced by the speech ticket bridge.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SpeechError {
    /// No voice matches the configured language filter.
    #[error("no candidate voices available")]
    VoiceUnavailable,
    /// The speech engine refused the utterance.
    #[error("speech engine rejected utterance: {0}")]
    Engine(String),
}

/// Allowed-target persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("target store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("target store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid {field} {value:?}")]
    Invalid { field: &'static str, value: String },
}
