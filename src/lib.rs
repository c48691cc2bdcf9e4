#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::unused_async)]

//! surfbridge library: the control layer around a packet-forwarding engine.
//!
//! - `session`: tunnel session lifecycle (permission, establish, stop)
//! - `directory`: server list snapshots, selection, single observer
//! - `speech`: completion tickets for speech synthesis
//! - `targets`: persisted set of applications routed through the tunnel
//! - `engine`: engine trait, event queue, built-in local engine
//! - `platform`: tunnel platform and notification collaborators
//! - `bridge`: the synchronous call surface the UI layer uses
//! - `routes`: REST API route handlers
//! - `auth`: API key authentication middleware
//! - `config`: configuration loading

pub mod auth;
pub mod bridge;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod platform;
pub mod routes;
pub mod session;
pub mod speech;
pub mod state;
pub mod targets;
mod util;

#[cfg(test)]
mod testing;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use bridge::{Bridge, BridgeParts};
pub use config::Config;
pub use state::AppState;
