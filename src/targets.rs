//! Allowed-target set: which applications are routed through the tunnel.
//!
//! The set is a persisted map from opaque target identifier to `true`.
//! Absence of a key means "excluded"; excluding a target removes its key
//! rather than storing `false`. On first use (empty store) the set is seeded
//! with [`DEFAULT_TARGETS`] plus every installed identifier that starts with
//! [`DEFAULT_TARGET_PREFIX`].
//!
//! Persistence goes through [`TargetStore`]; the identity of installed
//! applications comes from a [`TargetCatalog`]. Both are collaborators.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::util::lock;

/// Identifiers included on first initialization regardless of what is installed.
pub const DEFAULT_TARGETS: &[&str] = &[
    "org.mozilla.firefox",
    "org.telegram.messenger",
    "im.vector.app",
    "jp.pxv.android",
    "moe.tarsin.ehviewer",
];

/// Installed identifiers with this prefix are included on first initialization.
pub const DEFAULT_TARGET_PREFIX: &str = "com.google";

/// An application known to the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledTarget {
    pub id: String,
    #[serde(default)]
    pub label: String,
    /// System applications are hidden from the selection list by default.
    #[serde(default)]
    pub system: bool,
}

/// One row of the target-selection surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetEntry {
    pub id: String,
    pub label: String,
    pub system: bool,
    pub included: bool,
}

/// Source of installed applications.
pub trait TargetCatalog: Send + Sync {
    fn installed(&self) -> Vec<InstalledTarget>;
}

/// Fixed catalog, used where the host has no package manager to ask.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog(pub Vec<InstalledTarget>);

impl TargetCatalog for StaticCatalog {
    fn installed(&self) -> Vec<InstalledTarget> {
        self.0.clone()
    }
}

/// Key-value persistence for the allowed-target map.
pub trait TargetStore: Send + Sync {
    fn load(&self) -> Result<BTreeMap<String, bool>, StoreError>;
    fn save(&self, entries: &BTreeMap<String, bool>) -> Result<(), StoreError>;
}

/// In-memory store (tests, ephemeral sessions).
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, bool>>,
}

impl MemoryStore {
    pub fn with_entries(entries: BTreeMap<String, bool>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl TargetStore for MemoryStore {
    fn load(&self) -> Result<BTreeMap<String, bool>, StoreError> {
        Ok(lock(&self.entries).clone())
    }

    fn save(&self, entries: &BTreeMap<String, bool>) -> Result<(), StoreError> {
        *lock(&self.entries) = entries.clone();
        Ok(())
    }
}

/// Monotonic counter to uniquify temp file names across concurrent saves.
static SAVE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// JSON object on disk, written with temp-file-then-rename.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TargetStore for JsonFileStore {
    fn load(&self) -> Result<BTreeMap<String, bool>, StoreError> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, entries: &BTreeMap<String, bool>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let seq = SAVE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .path
            .with_extension(format!("tmp.{}.{seq}", std::process::id()));
        std::fs::write(&temp, serde_json::to_vec_pretty(entries)?)?;
        if let Err(e) = std::fs::rename(&temp, &self.path) {
            let _ = std::fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }
}

/// The persisted set of targets routed through the tunnel.
pub struct AllowedTargetSet {
    store: Arc<dyn TargetStore>,
    entries: Mutex<BTreeMap<String, bool>>,
}

impl AllowedTargetSet {
    /// Load the set, seeding the defaults when the store is empty.
    pub fn open_or_init(
        store: Arc<dyn TargetStore>,
        catalog: &dyn TargetCatalog,
    ) -> Result<Self, StoreError> {
        let mut entries = store.load()?;
        entries.retain(|_, included| *included);

        if entries.is_empty() {
            entries = default_entries(catalog);
            store.save(&entries)?;
            info!("Targets: initialized default set ({} entries)", entries.len());
        } else {
            debug!("Targets: loaded {} entries", entries.len());
        }

        Ok(Self {
            store,
            entries: Mutex::new(entries),
        })
    }

    /// Sorted identifiers of every included target.
    pub fn included(&self) -> Vec<String> {
        lock(&self.entries).keys().cloned().collect()
    }

    pub fn is_included(&self, id: &str) -> bool {
        lock(&self.entries).contains_key(id)
    }

    /// Include or exclude a target and persist the change.
    ///
    /// Excluding removes the key. The in-memory set is only updated once the
    /// store accepted the write.
    pub fn set_included(&self, id: &str, included: bool) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        let mut next = entries.clone();
        let changed = if included {
            next.insert(id.to_string(), true).is_none()
        } else {
            next.remove(id).is_some()
        };
        if !changed {
            return Ok(());
        }
        self.store.save(&next)?;
        *entries = next;
        debug!("Targets: {id} included={included}");
        Ok(())
    }

    /// Rows for the target-selection surface, sorted by identifier.
    ///
    /// System applications are listed only when `show_system` is set.
    pub fn entries(&self, catalog: &dyn TargetCatalog, show_system: bool) -> Vec<TargetEntry> {
        let installed = catalog.installed();
        let entries = lock(&self.entries);
        let mut rows: Vec<TargetEntry> = installed
            .into_iter()
            .filter(|t| show_system || !t.system)
            .map(|t| TargetEntry {
                included: entries.contains_key(&t.id),
                id: t.id,
                label: t.label,
                system: t.system,
            })
            .collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }
}

fn default_entries(catalog: &dyn TargetCatalog) -> BTreeMap<String, bool> {
    let mut entries: BTreeMap<String, bool> = DEFAULT_TARGETS
        .iter()
        .map(|id| ((*id).to_string(), true))
        .collect();
    for target in catalog.installed() {
        if target.id.starts_with(DEFAULT_TARGET_PREFIX) {
            entries.insert(target.id, true);
        }
    }
    entries
}
