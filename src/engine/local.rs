//! Built-in engine: server list, latency probes, selection, and a tunnel
//! drain.
//!
//! The server list comes from a JSON cache plus the servers named in the
//! config; each refresh probes every server with a TCP connect and pushes a
//! full snapshot after each measurement. The selection is persisted to
//! `selected.json` next to the cache.
//!
//! Packet forwarding is out of scope for this engine: once established it
//! reads and counts packets from the tunnel descriptor until halted, which
//! keeps the interface alive and observable.

use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::unix::AsyncFd;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Engine, EventSink};
use crate::config::Config;
use crate::directory::ServerDescriptor;
use crate::util::lock;

/// Delay recorded for a server that could not be reached.
pub const PROBE_FAILURE_DELAY_MS: u64 = 30_000;

const SELECTION_FILE: &str = "selected.json";

/// Measure the TCP connect latency of `server` in milliseconds.
///
/// Unreachable servers (refused, unresolvable, or slower than `timeout`)
/// report [`PROBE_FAILURE_DELAY_MS`].
#[allow(clippy::cast_possible_truncation)]
pub async fn probe(server: &ServerDescriptor, timeout: Duration) -> u64 {
    let started = Instant::now();
    let target = (server.address.as_str(), server.port);
    match tokio::time::timeout(timeout, TcpStream::connect(target)).await {
        Ok(Ok(_stream)) => started.elapsed().as_millis() as u64,
        Ok(Err(e)) => {
            debug!("Probe: {}:{} unreachable: {e}", server.address, server.port);
            PROBE_FAILURE_DELAY_MS
        }
        Err(_) => {
            debug!("Probe: {}:{} timed out", server.address, server.port);
            PROBE_FAILURE_DELAY_MS
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    packets: AtomicU64,
    bytes: AtomicU64,
}

struct Forwarding {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Shared {
    seed: Vec<ServerDescriptor>,
    cache_path: PathBuf,
    selection_path: PathBuf,
    probe_timeout: Duration,
    servers: Mutex<Vec<ServerDescriptor>>,
    selected: Mutex<Option<ServerDescriptor>>,
    observer: Mutex<Option<EventSink>>,
    loaded: tokio::sync::OnceCell<()>,
    counters: Counters,
}

impl Shared {
    /// Push the current list to the observer while holding the list lock, so
    /// snapshots are queued in the order the list changed.
    fn publish(&self, servers: &[ServerDescriptor]) {
        if let Some(sink) = lock(&self.observer).as_ref() {
            sink.snapshot(servers.to_vec());
        }
    }

    /// Fill the list from the cache and the configured servers. The caller
    /// publishes the result.
    async fn load(&self) {
        let cached = match tokio::fs::read(&self.cache_path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<ServerDescriptor>>(&bytes) {
                Ok(cached) => {
                    debug!("Engine: {} servers from cache", cached.len());
                    cached
                }
                Err(e) => {
                    warn!("Engine: ignoring corrupt server cache: {e}");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("Engine: reading server cache: {e}");
                Vec::new()
            }
        };

        let list = merge_seed(&self.seed, cached);
        *lock(&self.servers) = list.clone();
        if !self.seed.is_empty() {
            self.persist_servers(&list).await;
        }
    }

    async fn persist_servers(&self, list: &[ServerDescriptor]) {
        let result = async {
            if let Some(parent) = self.cache_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let json = serde_json::to_vec_pretty(list).map_err(std::io::Error::other)?;
            tokio::fs::write(&self.cache_path, json).await
        }
        .await;
        if let Err(e) = result {
            warn!("Engine: writing server cache: {e}");
        }
    }

    fn record_delay(&self, target: &ServerDescriptor, delay: u64) {
        let mut servers = lock(&self.servers);
        let mut changed = false;
        for server in servers.iter_mut().filter(|s| s.same_identity(target)) {
            server.delay = Some(delay);
            changed = true;
        }
        if changed {
            self.publish(&servers);
        }
    }

    async fn probe_all(self: Arc<Self>) {
        let list = lock(&self.servers).clone();
        info!("Engine: probing {} servers", list.len());
        let probes: Vec<_> = list
            .into_iter()
            .map(|server| {
                let shared = Arc::clone(&self);
                tokio::spawn(async move {
                    let delay = probe(&server, shared.probe_timeout).await;
                    shared.record_delay(&server, delay);
                })
            })
            .collect();
        for probe in probes {
            if let Err(e) = probe.await {
                error!("Engine: probe task failed: {e}");
            }
        }
        let list = lock(&self.servers).clone();
        self.persist_servers(&list).await;
    }
}

/// Configured servers first, each keeping the cached delay of the same
/// identity, then cached servers the config does not name.
fn merge_seed(seed: &[ServerDescriptor], cached: Vec<ServerDescriptor>) -> Vec<ServerDescriptor> {
    let mut merged: Vec<ServerDescriptor> = seed
        .iter()
        .map(|s| {
            let mut server = s.clone();
            if server.delay.is_none() {
                server.delay = cached
                    .iter()
                    .find(|c| c.same_identity(s))
                    .and_then(|c| c.delay);
            }
            server
        })
        .collect();
    for server in cached {
        if !merged.iter().any(|s| s.same_identity(&server)) {
            merged.push(server);
        }
    }
    merged
}

/// Engine implementation used by the daemon.
pub struct LocalEngine {
    shared: Arc<Shared>,
    forwarding: Mutex<Option<Forwarding>>,
    runtime: Handle,
}

impl LocalEngine {
    /// Build from config. Must be called inside a Tokio runtime.
    pub fn new(config: &Config) -> Self {
        let cache_path = config.server_cache_path();
        let selection_path = config.data_dir().join(SELECTION_FILE);
        let selected = read_selection(&selection_path);
        if let Some(s) = &selected {
            debug!("Engine: restored selection {} ({}:{})", s.name, s.address, s.port);
        }
        Self {
            shared: Arc::new(Shared {
                seed: config.directory.servers.clone(),
                cache_path,
                selection_path,
                probe_timeout: Duration::from_millis(config.directory.probe_timeout_ms),
                servers: Mutex::new(Vec::new()),
                selected: Mutex::new(selected),
                observer: Mutex::new(None),
                loaded: tokio::sync::OnceCell::new(),
                counters: Counters::default(),
            }),
            forwarding: Mutex::new(None),
            runtime: Handle::current(),
        }
    }

    /// Packets and bytes read from the tunnel since startup.
    pub fn traffic(&self) -> (u64, u64) {
        let c = &self.shared.counters;
        (c.packets.load(Ordering::Relaxed), c.bytes.load(Ordering::Relaxed))
    }
}

fn read_selection(path: &Path) -> Option<ServerDescriptor> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(server) => Some(server),
        Err(e) => {
            warn!("Engine: ignoring corrupt selection file: {e}");
            None
        }
    }
}

impl Engine for LocalEngine {
    fn establish(&self, config_path: &Path, tun_fd: RawFd) -> Result<(), String> {
        self.halt();

        // SAFETY: the caller hands ownership of tun_fd to the engine; wrapping
        // it here makes it close on every path below.
        let file = unsafe { File::from_raw_fd(tun_fd) };

        let Some(server) = lock(&self.shared.selected).clone() else {
            return Err("no server selected".to_string());
        };
        if !config_path.exists() {
            warn!("Engine: config {} missing, using defaults", config_path.display());
        }

        set_nonblocking(tun_fd).map_err(|e| format!("set O_NONBLOCK: {e}"))?;
        let _guard = self.runtime.enter();
        let tun = AsyncFd::new(file).map_err(|e| format!("register tunnel fd: {e}"))?;

        let cancel = CancellationToken::new();
        let shared = Arc::clone(&self.shared);
        let task = self.runtime.spawn(drain(tun, cancel.clone(), shared));
        *lock(&self.forwarding) = Some(Forwarding { cancel, task });

        info!(
            "Engine: started via {} ({}:{})",
            server.name, server.address, server.port
        );
        Ok(())
    }

    fn halt(&self) {
        if let Some(forwarding) = lock(&self.forwarding).take() {
            forwarding.cancel.cancel();
            forwarding.task.abort();
            debug!("Engine: halted");
        }
    }

    fn is_running(&self) -> bool {
        lock(&self.forwarding)
            .as_ref()
            .is_some_and(|f| !f.task.is_finished())
    }

    fn enumerate_servers(&self) {
        let shared = Arc::clone(&self.shared);
        self.runtime.spawn(async move {
            shared.loaded.get_or_init(|| shared.load()).await;
            {
                let servers = lock(&shared.servers);
                shared.publish(&servers);
            }
            shared.probe_all().await;
        });
    }

    fn selected_server(&self) -> Option<ServerDescriptor> {
        lock(&self.shared.selected).clone()
    }

    fn set_selected_server(&self, server: &ServerDescriptor) {
        *lock(&self.shared.selected) = Some(server.clone());
        let path = self.shared.selection_path.clone();
        let server = server.clone();
        self.runtime.spawn(async move {
            let result = async {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let json = serde_json::to_vec_pretty(&server).map_err(std::io::Error::other)?;
                tokio::fs::write(&path, json).await
            }
            .await;
            if let Err(e) = result {
                warn!("Engine: persisting selection: {e}");
            }
        });
    }

    fn register_directory_observer(&self, sink: Option<EventSink>) {
        *lock(&self.shared.observer) = sink;
    }
}

fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: fcntl on a descriptor we own; F_GETFL/F_SETFL take no pointers.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags == -1 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

async fn drain(tun: AsyncFd<File>, cancel: CancellationToken, shared: Arc<Shared>) {
    let mut buf = vec![0u8; 65_536];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            ready = tun.readable() => {
                let mut guard = match ready {
                    Ok(guard) => guard,
                    Err(e) => {
                        error!("Engine: tunnel poll failed: {e}");
                        break;
                    }
                };
                match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => {
                        shared.counters.packets.fetch_add(1, Ordering::Relaxed);
                        shared.counters.bytes.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        error!("Engine: tunnel read failed: {e}");
                        break;
                    }
                    Err(_would_block) => {}
                }
            }
        }
    }
    debug!(
        "Engine: drain stopped after {} packets",
        shared.counters.packets.load(Ordering::Relaxed)
    );
}
