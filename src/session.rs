//! Tunnel session controller.
//!
//! Owns the lifecycle of the privileged tunnel: permission, interface
//! creation, handing the descriptor to the engine, and teardown.
//!
//! ```text
//!            start (no permission)         permission granted + start
//!   Idle ─────────────────────────▶ PermissionPending ───────────────┐
//!    ▲ ▲                                   │ denied                   │
//!    │ └───────────────────────────────────┘                          ▼
//!    │        establish failed                                  Establishing
//!    ├──────────────────────────────────────────────────────────────┤
//!    │                                                              ▼
//!    └──────────── Stopping ◀──────────── stop ─────────────── Running
//! ```
//!
//! The state lock is never held across a platform, engine, or notifier call.
//! A stop that lands while a start is still establishing bumps the attempt
//! counter; the start notices on its next check, releases whatever it
//! created, and reports [`StartOutcome::Cancelled`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::Engine;
use crate::error::SessionError;
use crate::platform::{Notifier, PermissionRequest, TunnelInterface, TunnelParams, TunnelPlatform};
use crate::targets::AllowedTargetSet;
use crate::util::{lock, now_ms};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    PermissionPending,
    Establishing,
    Running,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::PermissionPending => "permission_pending",
            Self::Establishing => "establishing",
            Self::Running => "running",
            Self::Stopping => "stopping",
        })
    }
}

/// What a call to [`SessionController::start`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The user must grant the permission, then call start again.
    PermissionRequired(PermissionRequest),
    Started,
    AlreadyRunning,
    /// Another start or a stop is in progress.
    InProgress,
    /// A stop arrived while establishing; nothing is left running.
    Cancelled,
}

/// Session snapshot for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub running: bool,
    pub engine_running: bool,
    pub interface: Option<String>,
    pub running_since_ms: Option<u64>,
}

/// Tunnel parameters and engine settings, resolved from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub interface: String,
    pub mtu: u16,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub dns: IpAddr,
    pub route: (Ipv4Addr, u8),
    /// Our own target id, excluded from the allowed targets.
    pub own_id: String,
    pub engine_config: PathBuf,
    pub rollback_on_engine_failure: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        let tunnel = &config.tunnel;
        Self {
            interface: tunnel.interface.clone(),
            mtu: tunnel.mtu,
            address: tunnel.address,
            prefix_len: tunnel.prefix_len,
            dns: tunnel.dns,
            route: tunnel.route(),
            own_id: tunnel.own_id.clone(),
            engine_config: config.engine_config_path(),
            rollback_on_engine_failure: tunnel.rollback_on_engine_failure,
        }
    }
}

/// Owns the platform interface; closing is idempotent and also happens on drop.
pub struct TunnelHandle {
    iface: Box<dyn TunnelInterface>,
    closed: bool,
}

impl TunnelHandle {
    fn new(iface: Box<dyn TunnelInterface>) -> Self {
        Self {
            iface,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        self.iface.name()
    }

    fn detach_fd(&mut self) -> Option<RawFd> {
        self.iface.detach_fd()
    }

    /// Close the interface. Errors are logged, never returned.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.iface.close() {
            warn!("Session: closing {} failed: {e}", self.iface.name());
        }
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.close();
    }
}

struct SessionInner {
    state: SessionState,
    handle: Option<TunnelHandle>,
    /// Bumped by every start and stop; a start that sees a different value
    /// after a collaborator call was overtaken by a stop.
    attempt: u64,
    /// A start is between its first and last state check.
    start_in_flight: bool,
    running_since: Option<u64>,
}

/// Clears `start_in_flight` on every exit path of `start`.
struct InFlight<'a>(&'a Mutex<SessionInner>);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.0).start_in_flight = false;
    }
}

pub struct SessionController {
    settings: SessionSettings,
    platform: Arc<dyn TunnelPlatform>,
    engine: Arc<dyn Engine>,
    notifier: Arc<dyn Notifier>,
    targets: Arc<AllowedTargetSet>,
    inner: Mutex<SessionInner>,
}

impl SessionController {
    pub fn new(
        settings: SessionSettings,
        platform: Arc<dyn TunnelPlatform>,
        engine: Arc<dyn Engine>,
        notifier: Arc<dyn Notifier>,
        targets: Arc<AllowedTargetSet>,
    ) -> Self {
        Self {
            settings,
            platform,
            engine,
            notifier,
            targets,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                handle: None,
                attempt: 0,
                start_in_flight: false,
                running_since: None,
            }),
        }
    }

    /// Bring the tunnel up, or report why it was not.
    ///
    /// Blocks on platform and engine calls; call from a blocking context.
    ///
    /// # Errors
    ///
    /// - [`SessionError::Establishment`]: the platform refused the interface
    /// - [`SessionError::EngineInvocation`]: the engine refused the descriptor
    ///   (the session is rolled back when so configured)
    pub fn start(&self) -> Result<StartOutcome, SessionError> {
        let granted = self.platform.permission_granted();

        let attempt = {
            let mut inner = lock(&self.inner);
            if inner.start_in_flight {
                return Ok(StartOutcome::InProgress);
            }
            match inner.state {
                SessionState::Running => return Ok(StartOutcome::AlreadyRunning),
                SessionState::Establishing | SessionState::Stopping => {
                    return Ok(StartOutcome::InProgress)
                }
                SessionState::Idle | SessionState::PermissionPending => {}
            }
            if !granted {
                inner.state = SessionState::PermissionPending;
                drop(inner);
                let request = self.platform.request_permission();
                info!("Session: permission required (request {})", request.id);
                return Ok(StartOutcome::PermissionRequired(request));
            }
            inner.state = SessionState::Establishing;
            inner.start_in_flight = true;
            inner.attempt += 1;
            inner.attempt
        };
        let _in_flight = InFlight(&self.inner);

        let params = self.tunnel_params();
        info!(
            "Session: establishing {} ({} allowed targets)",
            params.interface,
            params.allowed_targets.len()
        );

        let iface = match self.platform.establish(&params) {
            Ok(iface) => iface,
            Err(e) => {
                let mut inner = lock(&self.inner);
                if inner.attempt == attempt && inner.state == SessionState::Establishing {
                    inner.state = SessionState::Idle;
                }
                drop(inner);
                error!("Session: establish failed: {e}");
                return Err(SessionError::Establishment(e));
            }
        };
        let mut handle = TunnelHandle::new(iface);
        let interface = handle.name().to_string();

        let fd = {
            let mut inner = lock(&self.inner);
            if inner.attempt != attempt {
                drop(inner);
                info!("Session: stopped while establishing, releasing {interface}");
                handle.close();
                return Ok(StartOutcome::Cancelled);
            }
            if let Some(fd) = handle.detach_fd() {
                inner.state = SessionState::Running;
                inner.running_since = Some(now_ms());
                inner.handle = Some(handle);
                fd
            } else {
                inner.state = SessionState::Idle;
                drop(inner);
                handle.close();
                error!("Session: {interface} has no descriptor");
                return Err(SessionError::Establishment(format!(
                    "{interface} has no descriptor"
                )));
            }
        };

        self.notifier.show_running(&interface);
        let result = self.engine.establish(&self.settings.engine_config, fd);

        let still_current = {
            let inner = lock(&self.inner);
            inner.attempt == attempt && inner.state == SessionState::Running
        };
        if !still_current {
            // The stop may have cancelled before our notification went up.
            info!("Session: stopped while the engine was starting");
            self.engine.halt();
            if let Err(e) = self.notifier.cancel() {
                debug!("Session: cancel notification: {e}");
            }
            return Ok(StartOutcome::Cancelled);
        }

        match result {
            Ok(()) => {
                info!("Session: running on {interface}");
                Ok(StartOutcome::Started)
            }
            Err(e) if self.settings.rollback_on_engine_failure => {
                error!("Session: engine refused {interface}: {e}; rolling back");
                self.stop();
                Err(SessionError::EngineInvocation(e))
            }
            Err(e) => {
                error!("Session: engine refused {interface}: {e}; interface left up");
                Err(SessionError::EngineInvocation(e))
            }
        }
    }

    /// Deliver the user's answer to a permission request.
    ///
    /// A grant only clears the way; the caller starts again. A denial returns
    /// the session to idle.
    pub fn on_permission_result(&self, granted: bool) -> Result<(), SessionError> {
        let mut inner = lock(&self.inner);
        if granted {
            debug!("Session: permission granted");
            return Ok(());
        }
        if inner.state == SessionState::PermissionPending {
            inner.state = SessionState::Idle;
        }
        drop(inner);
        warn!("Session: permission denied");
        Err(SessionError::PermissionDenied)
    }

    /// Tear everything down. Idempotent; never fails.
    pub fn stop(&self) {
        let (previous, handle) = {
            let mut inner = lock(&self.inner);
            let previous = inner.state;
            inner.state = SessionState::Stopping;
            inner.attempt += 1;
            inner.running_since = None;
            (previous, inner.handle.take())
        };

        self.engine.halt();
        if let Some(mut handle) = handle {
            handle.close();
        }
        if let Err(e) = self.notifier.cancel() {
            debug!("Session: cancel notification: {e}");
        }

        let mut inner = lock(&self.inner);
        if inner.state == SessionState::Stopping {
            inner.state = SessionState::Idle;
        }
        drop(inner);
        if previous != SessionState::Idle {
            info!("Session: stopped (was {previous})");
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner).state
    }

    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running
    }

    pub fn status(&self) -> SessionStatus {
        let (state, interface, running_since_ms) = {
            let inner = lock(&self.inner);
            (
                inner.state,
                inner.handle.as_ref().map(|h| h.name().to_string()),
                inner.running_since,
            )
        };
        SessionStatus {
            state,
            running: state == SessionState::Running,
            engine_running: self.engine.is_running(),
            interface,
            running_since_ms,
        }
    }

    fn tunnel_params(&self) -> TunnelParams {
        let s = &self.settings;
        TunnelParams {
            interface: s.interface.clone(),
            mtu: s.mtu,
            address: s.address,
            prefix_len: s.prefix_len,
            dns: s.dns,
            route: s.route,
            allowed_targets: self
                .targets
                .included()
                .into_iter()
                .filter(|id| *id != s.own_id)
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::*;
    use crate::targets::{MemoryStore, StaticCatalog};
    use crate::testing::{FakeEngine, FakePlatform, RecordingNotifier};

    struct Fixture {
        platform: Arc<FakePlatform>,
        engine: Arc<FakeEngine>,
        notifier: Arc<RecordingNotifier>,
        session: Arc<SessionController>,
    }

    fn settings() -> SessionSettings {
        SessionSettings::from_config(&Config::default())
    }

    fn fixture_with(settings: SessionSettings, platform: FakePlatform) -> Fixture {
        fixture_full(settings, platform, RecordingNotifier::default())
    }

    fn fixture_full(
        settings: SessionSettings,
        platform: FakePlatform,
        notifier: RecordingNotifier,
    ) -> Fixture {
        let mut entries = BTreeMap::new();
        entries.insert("org.mozilla.firefox".to_string(), true);
        entries.insert("surfbridge".to_string(), true);
        let targets = AllowedTargetSet::open_or_init(
            Arc::new(MemoryStore::with_entries(entries)),
            &StaticCatalog::default(),
        )
        .unwrap();

        let platform = Arc::new(platform);
        let engine = Arc::new(FakeEngine::default());
        let notifier = Arc::new(notifier);
        let session = Arc::new(SessionController::new(
            settings,
            platform.clone(),
            engine.clone(),
            notifier.clone(),
            Arc::new(targets),
        ));
        Fixture {
            platform,
            engine,
            notifier,
            session,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(settings(), FakePlatform::granted())
    }

    #[test]
    fn test_start_runs_engine_on_tunnel() {
        let f = fixture();
        assert_eq!(f.session.start().unwrap(), StartOutcome::Started);
        assert_eq!(f.session.state(), SessionState::Running);
        assert!(f.session.is_running());
        assert_eq!(f.engine.count("establish"), 1);
        assert_eq!(f.platform.live_handles(), 1);
        assert_eq!(f.notifier.shown(), 1);

        let status = f.session.status();
        assert_eq!(status.interface.as_deref(), Some("surf0"));
        assert!(status.running_since_ms.is_some());
    }

    #[test]
    fn test_tunnel_params_exclude_own_id() {
        let f = fixture();
        f.session.start().unwrap();
        let params = f.platform.last_params().unwrap();
        assert_eq!(params.allowed_targets, vec!["org.mozilla.firefox".to_string()]);
        assert_eq!(params.mtu, 1500);
        assert_eq!(params.address, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(params.prefix_len, 24);
        assert_eq!(params.route, (Ipv4Addr::UNSPECIFIED, 0));
    }

    #[test]
    fn test_second_start_reports_already_running() {
        let f = fixture();
        f.session.start().unwrap();
        assert_eq!(f.session.start().unwrap(), StartOutcome::AlreadyRunning);
        assert_eq!(f.platform.establish_calls(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let f = fixture();
        f.session.start().unwrap();
        f.session.stop();
        f.session.stop();
        assert_eq!(f.session.state(), SessionState::Idle);
        assert!(!f.session.is_running());
        assert_eq!(f.platform.live_handles(), 0);
        assert_eq!(f.platform.close_calls(), 1);
        assert!(!f.engine.is_running());
    }

    #[test]
    fn test_stop_when_idle_swallows_notifier_error() {
        let f = fixture();
        f.session.stop();
        assert_eq!(f.session.state(), SessionState::Idle);
        assert_eq!(f.notifier.cancel_errors(), 1);
    }

    #[test]
    fn test_permission_flow() {
        let f = fixture_with(settings(), FakePlatform::denied());
        let outcome = f.session.start().unwrap();
        assert!(matches!(outcome, StartOutcome::PermissionRequired(_)));
        assert_eq!(f.session.state(), SessionState::PermissionPending);
        assert_eq!(f.platform.establish_calls(), 0);

        f.platform.grant();
        f.session.on_permission_result(true).unwrap();
        assert_eq!(f.session.start().unwrap(), StartOutcome::Started);
    }

    #[test]
    fn test_permission_denied_returns_to_idle() {
        let f = fixture_with(settings(), FakePlatform::denied());
        f.session.start().unwrap();
        assert_eq!(
            f.session.on_permission_result(false),
            Err(SessionError::PermissionDenied)
        );
        assert_eq!(f.session.state(), SessionState::Idle);
    }

    #[test]
    fn test_establish_failure_returns_to_idle() {
        let f = fixture_with(settings(), FakePlatform::failing("no tun device"));
        let err = f.session.start().unwrap_err();
        assert_eq!(err, SessionError::Establishment("no tun device".to_string()));
        assert_eq!(f.session.state(), SessionState::Idle);
        assert_eq!(f.engine.count("establish"), 0);
    }

    #[test]
    fn test_engine_failure_rolls_back() {
        let f = fixture();
        f.engine.fail_establish("no server selected");
        let err = f.session.start().unwrap_err();
        assert_eq!(err.code(), "ENGINE_FAILED");
        assert_eq!(f.session.state(), SessionState::Idle);
        assert_eq!(f.platform.live_handles(), 0);
        assert_eq!(f.notifier.shown(), 1);
        assert_eq!(f.notifier.cancelled(), 1);
    }

    #[test]
    fn test_engine_failure_without_rollback_leaves_interface() {
        let mut s = settings();
        s.rollback_on_engine_failure = false;
        let f = fixture_with(s, FakePlatform::granted());
        f.engine.fail_establish("no server selected");
        assert!(f.session.start().is_err());
        assert!(f.session.is_running());
        assert!(!f.session.status().engine_running);
        assert_eq!(f.platform.live_handles(), 1);
        f.session.stop();
        assert_eq!(f.platform.live_handles(), 0);
    }

    #[test]
    fn test_concurrent_starts_create_one_interface() {
        let f = fixture_with(
            settings(),
            FakePlatform::granted().with_delay(Duration::from_millis(50)),
        );
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let session = Arc::clone(&f.session);
                std::thread::spawn(move || session.start().unwrap())
            })
            .collect();
        let outcomes: Vec<StartOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let started = outcomes.iter().filter(|o| **o == StartOutcome::Started).count();
        assert_eq!(started, 1);
        assert_eq!(f.platform.establish_calls(), 1);
        assert_eq!(f.platform.max_live_handles(), 1);
        assert_eq!(f.engine.count("establish"), 1);
    }

    #[test]
    fn test_stop_during_establish_releases_interface() {
        let f = fixture_with(
            settings(),
            FakePlatform::granted().with_delay(Duration::from_millis(200)),
        );
        let starter = {
            let session = Arc::clone(&f.session);
            std::thread::spawn(move || session.start().unwrap())
        };

        // Wait until the start is inside platform.establish
        while f.session.state() != SessionState::Establishing {
            std::thread::yield_now();
        }
        f.session.stop();
        assert_eq!(f.session.state(), SessionState::Idle);

        assert_eq!(starter.join().unwrap(), StartOutcome::Cancelled);
        assert_eq!(f.session.state(), SessionState::Idle);
        assert_eq!(f.platform.live_handles(), 0);
        assert_eq!(f.engine.count("establish"), 0);
    }

    #[test]
    fn test_start_while_cancelled_start_in_flight_is_in_progress() {
        let f = fixture_with(
            settings(),
            FakePlatform::granted().with_delay(Duration::from_millis(200)),
        );
        let starter = {
            let session = Arc::clone(&f.session);
            std::thread::spawn(move || session.start().unwrap())
        };
        while f.session.state() != SessionState::Establishing {
            std::thread::yield_now();
        }
        f.session.stop();
        assert_eq!(f.session.start().unwrap(), StartOutcome::InProgress);
        assert_eq!(starter.join().unwrap(), StartOutcome::Cancelled);

        assert_eq!(f.session.start().unwrap(), StartOutcome::Started);
        assert_eq!(f.platform.live_handles(), 1);
    }

    #[test]
    fn test_stop_while_notification_goes_up_leaves_nothing_shown() {
        let f = fixture_full(
            settings(),
            FakePlatform::granted(),
            RecordingNotifier::with_show_delay(Duration::from_millis(200)),
        );
        let starter = {
            let session = Arc::clone(&f.session);
            std::thread::spawn(move || session.start().unwrap())
        };

        // Running is set before the notification is shown
        while f.session.state() != SessionState::Running {
            std::thread::yield_now();
        }
        f.session.stop();

        assert_eq!(starter.join().unwrap(), StartOutcome::Cancelled);
        assert_eq!(f.session.state(), SessionState::Idle);
        assert!(!f.engine.is_running());
        assert!(!f.notifier.showing());
        assert_eq!(f.platform.live_handles(), 0);
    }
}
