//! Synchronous bridge between the UI layer and the native core.
//!
//! The UI can only make blocking calls and poll. [`Bridge`] is the single
//! object those calls go through: session control, the two configuration
//! surfaces, URL opening, and speech with completion tickets. Every method
//! returns promptly except [`Bridge::start_session`], which waits on the
//! platform and engine and is meant for a blocking context.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::directory::DirectorySync;
use crate::engine::{Engine, EventQueue, EventSink};
use crate::error::{SessionError, StoreError};
use crate::platform::{Notifier, TunnelPlatform};
use crate::session::{SessionController, SessionSettings, StartOutcome};
use crate::speech::{SpeechEngine, TicketBridge, VoiceFilter};
use crate::targets::{AllowedTargetSet, TargetCatalog, TargetEntry};

/// Opens user-facing surfaces on the host.
pub trait Shell: Send + Sync {
    /// Show the target-selection surface.
    fn open_target_config(&self);
    /// Show the server directory surface.
    fn open_server_directory(&self);
    fn open_url(&self, url: &str) -> Result<(), String>;
}

/// Shell for headless hosts: surfaces are logged (they are served by the
/// HTTP API), URLs go to `xdg-open`.
#[derive(Debug, Default)]
pub struct LogShell;

impl Shell for LogShell {
    fn open_target_config(&self) {
        info!("Shell: target selection requested (GET /api/targets)");
    }

    fn open_server_directory(&self) {
        info!("Shell: server directory requested (GET /api/servers)");
    }

    fn open_url(&self, url: &str) -> Result<(), String> {
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(format!("refusing to open non-web URL {url:?}"));
        }
        let mut child = std::process::Command::new("xdg-open")
            .arg(url)
            .spawn()
            .map_err(|e| format!("failed to run xdg-open: {e}"))?;
        std::thread::spawn(move || {
            if let Err(e) = child.wait() {
                warn!("Shell: xdg-open: {e}");
            }
        });
        Ok(())
    }
}

/// Collaborators the bridge is assembled from.
pub struct BridgeParts {
    pub settings: SessionSettings,
    pub platform: Arc<dyn TunnelPlatform>,
    pub engine: Arc<dyn Engine>,
    pub notifier: Arc<dyn Notifier>,
    pub speech: Arc<dyn SpeechEngine>,
    pub voice_filter: VoiceFilter,
    pub targets: Arc<AllowedTargetSet>,
    pub catalog: Arc<dyn TargetCatalog>,
    pub shell: Arc<dyn Shell>,
}

pub struct Bridge {
    session: SessionController,
    directory: Arc<DirectorySync>,
    speech: Arc<TicketBridge>,
    targets: Arc<AllowedTargetSet>,
    catalog: Arc<dyn TargetCatalog>,
    shell: Arc<dyn Shell>,
    engine: Arc<dyn Engine>,
}

impl Bridge {
    /// Assemble the core and point the engine's directory pushes at `sink`.
    pub fn new(parts: BridgeParts, sink: EventSink) -> Self {
        let directory = Arc::new(DirectorySync::new(Arc::clone(&parts.engine)));
        parts.engine.register_directory_observer(Some(sink));
        Self {
            session: SessionController::new(
                parts.settings,
                parts.platform,
                Arc::clone(&parts.engine),
                parts.notifier,
                Arc::clone(&parts.targets),
            ),
            directory,
            speech: Arc::new(TicketBridge::new(parts.speech, parts.voice_filter)),
            targets: parts.targets,
            catalog: parts.catalog,
            shell: parts.shell,
            engine: parts.engine,
        }
    }

    /// Run the engine event consumer on the current runtime.
    pub fn spawn_dispatcher(&self, queue: EventQueue) -> JoinHandle<()> {
        queue.spawn(Arc::clone(&self.directory), Arc::clone(&self.speech))
    }

    pub fn start_session(&self) -> Result<StartOutcome, SessionError> {
        self.session.start()
    }

    pub fn permission_result(&self, granted: bool) -> Result<(), SessionError> {
        self.session.on_permission_result(granted)
    }

    pub fn stop_session(&self) {
        self.session.stop();
    }

    pub fn is_running(&self) -> bool {
        self.session.is_running()
    }

    pub fn session(&self) -> &SessionController {
        &self.session
    }

    pub fn configure_targets(&self) {
        self.shell.open_target_config();
    }

    /// Open the directory surface and ask the engine for a fresh list.
    pub fn select_server_screen(&self) {
        self.shell.open_server_directory();
        self.directory.refresh();
    }

    pub fn open_url(&self, url: &str) -> Result<(), String> {
        self.shell.open_url(url)
    }

    pub fn voices(&self) -> Vec<String> {
        self.speech.voice_names()
    }

    /// Queue an utterance; returns its ticket or `""` when rejected.
    pub fn speak(&self, text: &str, voice: Option<&str>, volume: f32) -> String {
        self.speech.submit(text, voice, volume)
    }

    pub fn poll_completion(&self, ticket: &str) -> bool {
        self.speech.is_done(ticket)
    }

    pub fn directory(&self) -> &Arc<DirectorySync> {
        &self.directory
    }

    pub fn speech(&self) -> &Arc<TicketBridge> {
        &self.speech
    }

    pub fn target_entries(&self, show_system: bool) -> Vec<TargetEntry> {
        self.targets.entries(self.catalog.as_ref(), show_system)
    }

    pub fn set_target_included(&self, id: &str, included: bool) -> Result<(), StoreError> {
        self.targets.set_included(id, included)
    }

    pub fn targets(&self) -> &AllowedTargetSet {
        &self.targets
    }

    /// Stop pushes and the session before exit.
    pub fn shutdown(&self) {
        self.engine.register_directory_observer(None);
        self.directory.register_observer(None);
        self.session.stop();
    }
}
