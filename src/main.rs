#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # surfbridge
//!
//! Control daemon for a packet-forwarding engine.
//!
//! surfbridge owns the privileged tunnel session, keeps the engine's server
//! directory in sync with the UI, tracks which applications are routed
//! through the tunnel, and bridges speech synthesis to pollable completion
//! tickets. Everything is exposed over a local HTTP API protected by a
//! pre-shared key.
//!
//! ## Subcommands
//!
//! - `surfbridge serve` (default): run the daemon
//! - `surfbridge probe`: measure the latency of every known server and exit
//!
//! ## API surface
//!
//! | Method | Path                        | Auth | Description                         |
//! |--------|-----------------------------|------|-------------------------------------|
//! | GET    | `/api/health`               | No   | Liveness probe                      |
//! | GET    | `/api/session`              | Yes  | Session state                       |
//! | POST   | `/api/session/start`        | Yes  | Bring the tunnel up                 |
//! | POST   | `/api/session/permission`   | Yes  | Answer a permission request         |
//! | POST   | `/api/session/stop`         | Yes  | Tear the tunnel down                |
//! | POST   | `/api/shell/targets`        | Yes  | Open the target-selection surface   |
//! | POST   | `/api/shell/servers`        | Yes  | Open the server directory surface   |
//! | POST   | `/api/shell/open`           | Yes  | Open an external URL                |
//! | GET    | `/api/speech/voices`        | Yes  | Candidate voices                    |
//! | POST   | `/api/speech`               | Yes  | Queue an utterance, get a ticket    |
//! | GET    | `/api/speech/done`          | Yes  | Poll a ticket                       |
//! | GET    | `/api/servers`              | Yes  | Server list with delays             |
//! | GET    | `/api/servers/events`       | Yes  | SSE stream of server snapshots      |
//! | POST   | `/api/servers/refresh`      | Yes  | Re-enumerate and probe              |
//! | PUT    | `/api/servers/selected`     | Yes  | Select a server                     |
//! | GET    | `/api/targets`              | Yes  | Installed targets and inclusion     |
//! | PUT    | `/api/targets/{id}`         | Yes  | Include or exclude a target         |

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use surfbridge::bridge::LogShell;
use surfbridge::directory::{DelayStatus, ServerDescriptor};
use surfbridge::engine::local::{probe, LocalEngine};
use surfbridge::engine::{event_channel, write_default_engine_config};
use surfbridge::platform::linux::LinuxTun;
use surfbridge::platform::LogNotifier;
use surfbridge::session::SessionSettings;
use surfbridge::speech::espeak::CommandSpeech;
use surfbridge::speech::VoiceFilter;
use surfbridge::targets::{AllowedTargetSet, JsonFileStore, StaticCatalog};
use surfbridge::{routes, AppState, Bridge, BridgeParts, Config};

/// Control daemon for a packet-forwarding engine.
#[derive(Parser)]
#[command(name = "surfbridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Probe every known server once and print its delay.
    Probe {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Probe { config }) => run_probe(config.as_deref()).await,
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

fn load_config(path: Option<&str>) -> Config {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("surfbridge: {e}");
            std::process::exit(2);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
    config
}

async fn run_probe(config_path: Option<&str>) {
    let config = load_config(config_path);
    let timeout = Duration::from_millis(config.directory.probe_timeout_ms);

    let mut servers = config.directory.servers.clone();
    if let Ok(bytes) = tokio::fs::read(config.server_cache_path()).await {
        match serde_json::from_slice::<Vec<ServerDescriptor>>(&bytes) {
            Ok(cached) => {
                for server in cached {
                    if !servers.contains(&server) {
                        servers.push(server);
                    }
                }
            }
            Err(e) => warn!("Ignoring corrupt server cache: {e}"),
        }
    }
    if servers.is_empty() {
        warn!("No servers configured or cached");
        return;
    }

    for server in &servers {
        let delay = probe(server, timeout).await;
        println!(
            "{:<24} {:>21}  {}",
            server.name,
            format!("{}:{}", server.address, server.port),
            DelayStatus::from_delay(Some(delay))
        );
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = load_config(config_path);

    info!("surfbridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key; set SURFBRIDGE_API_KEY or update config");
    }

    let data_dir = config.data_dir();
    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!("Cannot create data dir {}: {e}", data_dir.display());
        std::process::exit(1);
    }
    match write_default_engine_config(&config.engine_config_path()) {
        Ok(true) => info!("Wrote default engine config {}", config.engine_config_path().display()),
        Ok(false) => {}
        Err(e) => warn!("Cannot write engine config: {e}"),
    }

    let catalog = Arc::new(StaticCatalog(config.targets.installed.clone()));
    let store = Arc::new(JsonFileStore::new(data_dir.join("targets.json")));
    let targets = match AllowedTargetSet::open_or_init(store, catalog.as_ref()) {
        Ok(targets) => Arc::new(targets),
        Err(e) => {
            error!("Cannot open allowed-target set: {e}");
            std::process::exit(1);
        }
    };

    let (sink, queue) = event_channel();
    let engine = Arc::new(LocalEngine::new(&config));
    let speech = match CommandSpeech::discover(&config.speech.program, sink.clone()).await {
        Ok(speech) => speech,
        Err(e) => {
            warn!("Speech disabled: {e}");
            CommandSpeech::with_voices(&config.speech.program, Vec::new(), sink.clone())
        }
    };

    let bridge = Arc::new(Bridge::new(
        BridgeParts {
            settings: SessionSettings::from_config(&config),
            platform: Arc::new(LinuxTun {
                install_routes: config.tunnel.install_routes,
            }),
            engine,
            notifier: Arc::new(LogNotifier::default()),
            speech: Arc::new(speech),
            voice_filter: VoiceFilter::new(&config.speech.language, config.speech.region.as_deref()),
            targets,
            catalog,
            shell: Arc::new(LogShell),
        },
        sink,
    ));
    let dispatcher = bridge.spawn_dispatcher(queue);
    bridge.directory().refresh();

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        bridge: Arc::clone(&bridge),
    };
    let app = routes::router(state.clone());

    let listener = match TcpListener::bind(&state.config.server.listen).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {e}", state.config.server.listen);
            std::process::exit(1);
        }
    };

    info!("Server ready");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {e}");
    }

    info!("Shutting down...");
    let teardown = Arc::clone(&bridge);
    if let Err(e) = tokio::task::spawn_blocking(move || teardown.shutdown()).await {
        error!("Shutdown task failed: {e}");
    }
    dispatcher.abort();
    remove_stale_temp_files(&state.config.data_dir());
    info!("Goodbye");
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}

/// Remove `targets.tmp.*` leftovers from interrupted saves.
fn remove_stale_temp_files(data_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(data_dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with("targets.tmp.") {
            let _ = std::fs::remove_file(entry.path());
        }
    }
}
