//! Server directory synchronizer.
//!
//! The engine owns server enumeration and latency probing; every time it learns
//! something new it pushes a **full** replacement list. [`DirectorySync`]
//! keeps the latest list plus the user's current selection and republishes
//! each snapshot to at most one registered [`DirectoryObserver`].
//!
//! ## Concurrency
//!
//! - The directory state (list, selection, observer registration) sits behind
//!   one short-held mutex. A snapshot replaces the list and reads the current
//!   registration in the same critical section, so a snapshot applied after an
//!   observer was unregistered is never delivered to it.
//! - Observers are invoked after that lock is released, so an observer may
//!   call straight back into the synchronizer (read the selection, select,
//!   even re-register) without deadlocking.
//! - Snapshot application and delivery are serialized by a separate delivery
//!   gate taken only on the engine-driven path. Observers therefore see
//!   snapshots in arrival order, each one whole.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::engine::Engine;
use crate::util::lock;

/// Delays at or above this many milliseconds are shown as a timeout.
pub const DELAY_TIMEOUT_MS: u64 = 5000;

/// A candidate server as reported by the engine.
///
/// Equality and hashing use the identity fields only (`address`, `port`,
/// `credential`, `method`); `name` and `delay` are presentation data that
/// may change between snapshots without changing which server this is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub credential: String,
    pub method: String,
    /// Last measured connect latency in milliseconds, if probed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<u64>,
}

impl ServerDescriptor {
    /// Whether `other` names the same server, ignoring name and delay.
    pub fn same_identity(&self, other: &ServerDescriptor) -> bool {
        self.address == other.address
            && self.port == other.port
            && self.credential == other.credential
            && self.method == other.method
    }

    pub fn delay_status(&self) -> DelayStatus {
        DelayStatus::from_delay(self.delay)
    }
}

impl PartialEq for ServerDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.same_identity(other)
    }
}

impl Eq for ServerDescriptor {}

impl Hash for ServerDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
        self.credential.hash(state);
        self.method.hash(state);
    }
}

/// How a server's delay is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayStatus {
    Unknown,
    Measured(u64),
    Timeout,
}

impl DelayStatus {
    pub fn from_delay(delay: Option<u64>) -> Self {
        match delay {
            None => Self::Unknown,
            Some(ms) if ms >= DELAY_TIMEOUT_MS => Self::Timeout,
            Some(ms) => Self::Measured(ms),
        }
    }
}

impl fmt::Display for DelayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("Unknown"),
            Self::Measured(ms) => write!(f, "{ms} ms"),
            Self::Timeout => f.write_str("Timeout"),
        }
    }
}

/// Immutable, shared view of one full server list.
pub type Snapshot = Arc<[ServerDescriptor]>;

/// Receiver of directory snapshots.
pub trait DirectoryObserver: Send + Sync {
    fn on_update(&self, servers: &[ServerDescriptor]);
}

impl<F> DirectoryObserver for F
where
    F: Fn(&[ServerDescriptor]) + Send + Sync,
{
    fn on_update(&self, servers: &[ServerDescriptor]) {
        self(servers);
    }
}

/// Names one observer registration; required to unregister it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverToken(u64);

struct Registration {
    token: ObserverToken,
    observer: Arc<dyn DirectoryObserver>,
}

struct DirectoryState {
    servers: Snapshot,
    selected: Option<ServerDescriptor>,
    observer: Option<Registration>,
    next_token: u64,
    snapshots_applied: u64,
}

/// Latest server list, current selection, and the single observer slot.
pub struct DirectorySync {
    engine: Arc<dyn Engine>,
    state: Mutex<DirectoryState>,
    /// Serializes snapshot application and delivery (engine path only).
    delivery: Mutex<()>,
}

fn install(state: &mut DirectoryState, observer: Arc<dyn DirectoryObserver>) -> ObserverToken {
    let token = ObserverToken(state.next_token);
    state.next_token += 1;
    state.observer = Some(Registration { token, observer });
    debug!("Directory: observer {token:?} registered");
    token
}

impl DirectorySync {
    /// Create an empty directory, seeding the selection from the engine.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        let selected = engine.selected_server();
        Self {
            engine,
            state: Mutex::new(DirectoryState {
                servers: Arc::from(Vec::new()),
                selected,
                observer: None,
                next_token: 1,
                snapshots_applied: 0,
            }),
            delivery: Mutex::new(()),
        }
    }

    /// Ask the engine to re-enumerate servers and start probing. Returns
    /// immediately; results arrive as snapshots.
    pub fn refresh(&self) {
        debug!("Directory: refresh requested");
        self.engine.enumerate_servers();
    }

    /// Replace the observer. The previous registration (if any) is removed
    /// first; passing `None` only deregisters.
    pub fn register_observer(
        &self,
        observer: Option<Arc<dyn DirectoryObserver>>,
    ) -> Option<ObserverToken> {
        let mut state = lock(&self.state);
        if let Some(previous) = state.observer.take() {
            debug!("Directory: observer {:?} unregistered", previous.token);
        }
        let observer = observer?;
        Some(install(&mut state, observer))
    }

    /// Replace the observer and hand it the latest snapshot before any newer
    /// one is delivered.
    pub fn subscribe(&self, observer: Arc<dyn DirectoryObserver>) -> ObserverToken {
        let _gate = lock(&self.delivery);
        let (token, snapshot) = {
            let mut state = lock(&self.state);
            if let Some(previous) = state.observer.take() {
                debug!("Directory: observer {:?} unregistered", previous.token);
            }
            let token = install(&mut state, Arc::clone(&observer));
            (token, Arc::clone(&state.servers))
        };
        observer.on_update(&snapshot);
        token
    }

    /// Remove the observer if `token` still names the current registration.
    ///
    /// Returns `false` when a newer observer has replaced it in the meantime,
    /// in which case nothing changes.
    pub fn unregister_observer(&self, token: ObserverToken) -> bool {
        let mut state = lock(&self.state);
        if state.observer.as_ref().is_some_and(|r| r.token == token) {
            state.observer = None;
            debug!("Directory: observer {token:?} unregistered");
            true
        } else {
            false
        }
    }

    pub fn has_observer(&self) -> bool {
        lock(&self.state).observer.is_some()
    }

    /// Apply a full replacement list pushed by the engine and deliver it to
    /// the registered observer.
    pub fn on_snapshot(&self, servers: Vec<ServerDescriptor>) {
        let _gate = lock(&self.delivery);

        let (snapshot, observer, seq) = {
            let mut state = lock(&self.state);
            state.servers = Arc::from(servers);
            state.snapshots_applied += 1;
            (
                Arc::clone(&state.servers),
                state.observer.as_ref().map(|r| Arc::clone(&r.observer)),
                state.snapshots_applied,
            )
        };

        debug!("Directory: snapshot #{seq} applied ({} servers)", snapshot.len());
        if let Some(observer) = observer {
            observer.on_update(&snapshot);
        }
    }

    /// The latest snapshot.
    pub fn servers(&self) -> Snapshot {
        Arc::clone(&lock(&self.state).servers)
    }

    /// Number of snapshots applied since creation.
    pub fn snapshots_applied(&self) -> u64 {
        lock(&self.state).snapshots_applied
    }

    /// The selected server, as it appears in the latest snapshot when present
    /// there (so its delay is current), otherwise as it was selected.
    pub fn current_selection(&self) -> Option<ServerDescriptor> {
        let state = lock(&self.state);
        let selected = state.selected.as_ref()?;
        Some(
            state
                .servers
                .iter()
                .find(|s| s.same_identity(selected))
                .unwrap_or(selected)
                .clone(),
        )
    }

    pub fn is_selected(&self, server: &ServerDescriptor) -> bool {
        lock(&self.state)
            .selected
            .as_ref()
            .is_some_and(|s| s.same_identity(server))
    }

    /// Select a server locally and tell the engine about it.
    pub fn select(&self, server: ServerDescriptor) {
        info!(
            "Directory: selected {} ({}:{})",
            server.name, server.address, server.port
        );
        lock(&self.state).selected = Some(server.clone());
        self.engine.set_selected_server(&server);
    }
}
