//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SURFBRIDGE_API_KEY`, `SURFBRIDGE_LISTEN`,
//!    `SURFBRIDGE_DATA_DIR`
//! 2. **Config file**: path via `--config <path>`, or `surfbridge.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:7345"
//! data_dir = "~/.local/share/surfbridge"
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [logging]
//! level = "info"
//!
//! [tunnel]
//! interface = "surf0"
//! mtu = 1500
//! address = "10.0.0.1"
//! prefix_len = 24
//! dns = "1.1.1.1"
//! route = "0.0.0.0/0"
//! own_id = "surfbridge"
//! engine_config = "acl.txt"          # relative to data_dir
//! rollback_on_engine_failure = true
//! install_routes = false
//!
//! [directory]
//! probe_timeout_ms = 5000
//! cache_file = "servers.json"        # relative to data_dir
//!
//! [[directory.servers]]
//! name = "jp-1"
//! address = "203.0.113.10"
//! port = 34274
//! credential = "secret"
//! method = "aes-256-gcm"
//!
//! [speech]
//! language = "ja"
//! region = "JP"
//! program = "espeak-ng"
//!
//! [[targets.installed]]
//! id = "org.mozilla.firefox"
//! label = "Firefox"
//! ```

use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::directory::ServerDescriptor;
use crate::error::ConfigError;
use crate::targets::InstalledTarget;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub targets: TargetsConfig,
}

/// HTTP control API settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:7345`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Directory for persisted state (targets, server cache, selection).
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token. Override with `SURFBRIDGE_API_KEY`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Parameters of the privileged tunnel interface.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Interface name requested from the platform (default `surf0`).
    #[serde(default = "default_interface")]
    pub interface: String,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Local address of the interface (default `10.0.0.1`).
    #[serde(default = "default_address")]
    pub address: Ipv4Addr,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    /// DNS resolver pushed to the interface (default `1.1.1.1`).
    #[serde(default = "default_dns")]
    pub dns: IpAddr,
    /// Route sent through the tunnel in CIDR form (default `0.0.0.0/0`).
    #[serde(default = "default_route")]
    pub route: String,
    /// Our own target identifier; never routed through our own tunnel.
    #[serde(default = "default_own_id")]
    pub own_id: String,
    /// Engine configuration file handed to the engine, relative to `data_dir`.
    #[serde(default = "default_engine_config")]
    pub engine_config: String,
    /// Tear the session down when the engine refuses the descriptor.
    #[serde(default = "default_true")]
    pub rollback_on_engine_failure: bool,
    /// Install `route` on the host routing table (Linux platform only).
    #[serde(default)]
    pub install_routes: bool,
}

/// Server directory settings used by the local engine.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryConfig {
    /// TCP connect timeout for latency probes, in milliseconds.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Server list cache, relative to `data_dir`.
    #[serde(default = "default_cache_file")]
    pub cache_file: String,
    /// Seed list of candidate servers.
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

/// Speech voice filter and engine program.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechConfig {
    /// Language subtag voices must match (default `ja`).
    #[serde(default = "default_language")]
    pub language: String,
    /// Region voices may carry; voices with no region also match.
    #[serde(default = "default_region")]
    pub region: Option<String>,
    #[serde(default = "default_speech_program")]
    pub program: String,
}

/// Installed-target catalog for hosts without a package manager.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetsConfig {
    #[serde(default)]
    pub installed: Vec<InstalledTarget>,
}

fn default_listen() -> String {
    "127.0.0.1:7345".to_string()
}
fn default_data_dir() -> String {
    "~/.local/share/surfbridge".to_string()
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_interface() -> String {
    "surf0".to_string()
}
fn default_mtu() -> u16 {
    1500
}
fn default_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}
fn default_prefix_len() -> u8 {
    24
}
fn default_dns() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))
}
fn default_route() -> String {
    "0.0.0.0/0".to_string()
}
fn default_own_id() -> String {
    "surfbridge".to_string()
}
fn default_engine_config() -> String {
    "acl.txt".to_string()
}
fn default_true() -> bool {
    true
}
fn default_probe_timeout_ms() -> u64 {
    5000
}
fn default_cache_file() -> String {
    "servers.json".to_string()
}
fn default_language() -> String {
    "ja".to_string()
}
#[allow(clippy::unnecessary_wraps)]
fn default_region() -> Option<String> {
    Some("JP".to_string())
}
fn default_speech_program() -> String {
    "espeak-ng".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            mtu: default_mtu(),
            address: default_address(),
            prefix_len: default_prefix_len(),
            dns: default_dns(),
            route: default_route(),
            own_id: default_own_id(),
            engine_config: default_engine_config(),
            rollback_on_engine_failure: default_true(),
            install_routes: false,
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: default_probe_timeout_ms(),
            cache_file: default_cache_file(),
            servers: Vec::new(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            language: default_language(),
            region: default_region(),
            program: default_speech_program(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `surfbridge.toml`
    /// in the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("surfbridge.toml").exists() => {
                Self::from_file(Path::new("surfbridge.toml"))?
            }
            None => Config::default(),
        };

        if let Ok(key) = std::env::var("SURFBRIDGE_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("SURFBRIDGE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(dir) = std::env::var("SURFBRIDGE_DATA_DIR") {
            config.server.data_dir = dir;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would otherwise be silently replaced.
    fn validate(&self) -> Result<(), ConfigError> {
        if parse_cidr(&self.tunnel.route).is_none() {
            return Err(ConfigError::Invalid {
                field: "tunnel.route",
                value: self.tunnel.route.clone(),
            });
        }
        Ok(())
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The data directory with a leading `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.server.data_dir).as_ref())
    }

    /// Absolute path of the engine configuration file.
    pub fn engine_config_path(&self) -> PathBuf {
        self.data_dir().join(&self.tunnel.engine_config)
    }

    /// Absolute path of the server list cache.
    pub fn server_cache_path(&self) -> PathBuf {
        self.data_dir().join(&self.directory.cache_file)
    }
}

impl TunnelConfig {
    /// Parse `route` into `(network, prefix)`. [`Config::load`] rejects
    /// malformed values; a hand-built config falls back to the default route.
    pub fn route(&self) -> (Ipv4Addr, u8) {
        parse_cidr(&self.route).unwrap_or((Ipv4Addr::UNSPECIFIED, 0))
    }
}

fn parse_cidr(value: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, prefix) = value.split_once('/')?;
    let prefix: u8 = prefix.trim().parse().ok()?;
    if prefix > 32 {
        return None;
    }
    Some((addr.trim().parse().ok()?, prefix))
}

/// Expand a leading `~` to `$HOME`; anything else passes through.
fn expand_home(path: &str) -> Cow<'_, str> {
    let Some(rest) = path.strip_prefix('~') else {
        return Cow::Borrowed(path);
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        return Cow::Borrowed(path);
    }
    match std::env::var("HOME") {
        Ok(home) => Cow::Owned(format!("{home}{rest}")),
        Err(_) => Cow::Borrowed(path),
    }
}
