//! In-memory collaborators shared by the unit tests.

use std::os::fd::RawFd;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::bridge::Shell;
use crate::directory::ServerDescriptor;
use crate::engine::{Engine, EventSink};
use crate::platform::{Notifier, PermissionRequest, TunnelInterface, TunnelParams, TunnelPlatform};
use crate::error::StoreError;
use crate::speech::{SpeechEngine, Utterance, Voice};
use crate::targets::{MemoryStore, TargetStore};
use crate::util::lock;

pub fn server(name: &str, address: &str, port: u16) -> ServerDescriptor {
    ServerDescriptor {
        name: name.to_string(),
        address: address.to_string(),
        port,
        credential: "secret".to_string(),
        method: "aes-256-gcm".to_string(),
        delay: None,
    }
}

pub fn voice(name: &str, language: &str, region: Option<&str>) -> Voice {
    Voice {
        name: name.to_string(),
        language: language.to_string(),
        region: region.map(ToString::to_string),
        requires_network: false,
    }
}

/// Engine that records calls.
#[derive(Default)]
pub struct FakeEngine {
    calls: Mutex<Vec<String>>,
    running: AtomicBool,
    establish_error: Mutex<Option<String>>,
    selected: Mutex<Option<ServerDescriptor>>,
    sink: Mutex<Option<EventSink>>,
}

impl FakeEngine {
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, call: &str) -> usize {
        lock(&self.calls).iter().filter(|c| *c == call).count()
    }

    /// Make every subsequent `establish` fail with `message`.
    pub fn fail_establish(&self, message: &str) {
        *lock(&self.establish_error) = Some(message.to_string());
    }

    pub fn sink(&self) -> Option<EventSink> {
        lock(&self.sink).clone()
    }

    fn record(&self, call: &str) {
        lock(&self.calls).push(call.to_string());
    }
}

impl Engine for FakeEngine {
    fn establish(&self, _config_path: &Path, _tun_fd: RawFd) -> Result<(), String> {
        self.record("establish");
        if let Some(e) = lock(&self.establish_error).clone() {
            return Err(e);
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn halt(&self) {
        self.record("halt");
        self.running.store(false, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn enumerate_servers(&self) {
        self.record("enumerate_servers");
    }

    fn selected_server(&self) -> Option<ServerDescriptor> {
        lock(&self.selected).clone()
    }

    fn set_selected_server(&self, server: &ServerDescriptor) {
        self.record("set_selected_server");
        *lock(&self.selected) = Some(server.clone());
    }

    fn register_directory_observer(&self, sink: Option<EventSink>) {
        self.record("register_directory_observer");
        *lock(&self.sink) = sink;
    }
}

/// Platform whose interfaces only count themselves.
#[derive(Default)]
pub struct FakePlatform {
    granted: AtomicBool,
    failure: Option<String>,
    delay: Option<Duration>,
    establish_calls: AtomicUsize,
    close_calls: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
    last_params: Mutex<Option<TunnelParams>>,
}

impl FakePlatform {
    pub fn granted() -> Self {
        let platform = Self::default();
        platform.grant();
        platform
    }

    pub fn denied() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::granted()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn grant(&self) {
        self.granted.store(true, Ordering::SeqCst);
    }

    pub fn establish_calls(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_live_handles(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub fn last_params(&self) -> Option<TunnelParams> {
        lock(&self.last_params).clone()
    }
}

impl TunnelPlatform for FakePlatform {
    fn permission_granted(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    fn request_permission(&self) -> PermissionRequest {
        PermissionRequest {
            id: Uuid::new_v4(),
            reason: "test".to_string(),
        }
    }

    fn establish(&self, params: &TunnelParams) -> Result<Box<dyn TunnelInterface>, String> {
        let n = self.establish_calls.fetch_add(1, Ordering::SeqCst);
        *lock(&self.last_params) = Some(params.clone());
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeInterface {
            name: params.interface.clone(),
            fd: Some(1000 + RawFd::try_from(n).unwrap_or(0)),
            closed: false,
            live: Arc::clone(&self.live),
            close_calls: Arc::clone(&self.close_calls),
        }))
    }
}

pub struct FakeInterface {
    name: String,
    fd: Option<RawFd>,
    closed: bool,
    live: Arc<AtomicUsize>,
    close_calls: Arc<AtomicUsize>,
}

impl TunnelInterface for FakeInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn detach_fd(&mut self) -> Option<RawFd> {
        self.fd.take()
    }

    fn close(&mut self) -> Result<(), String> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        if self.closed {
            return Err("already closed".to_string());
        }
        self.closed = true;
        self.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    show_delay: Option<Duration>,
    showing: AtomicBool,
    shown: AtomicUsize,
    cancelled: AtomicUsize,
    cancel_errors: AtomicUsize,
}

impl RecordingNotifier {
    /// Notifier whose `show_running` takes `delay` before the indicator is up.
    pub fn with_show_delay(delay: Duration) -> Self {
        Self {
            show_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn showing(&self) -> bool {
        self.showing.load(Ordering::SeqCst)
    }

    pub fn shown(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel_errors(&self) -> usize {
        self.cancel_errors.load(Ordering::SeqCst)
    }
}

impl Notifier for RecordingNotifier {
    fn show_running(&self, _interface: &str) {
        if let Some(delay) = self.show_delay {
            std::thread::sleep(delay);
        }
        self.showing.store(true, Ordering::SeqCst);
        self.shown.fetch_add(1, Ordering::SeqCst);
    }

    fn cancel(&self) -> Result<(), String> {
        if self.showing.swap(false, Ordering::SeqCst) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        } else {
            self.cancel_errors.fetch_add(1, Ordering::SeqCst);
            Err("nothing shown".to_string())
        }
    }
}

/// Speech engine that records utterances and never completes them itself.
#[derive(Default)]
pub struct FakeSpeech {
    voices: Vec<Voice>,
    spoken: Mutex<Vec<Utterance>>,
    fail_next: Mutex<Option<String>>,
}

impl FakeSpeech {
    pub fn with_voices(voices: Vec<Voice>) -> Self {
        Self {
            voices,
            ..Self::default()
        }
    }

    pub fn spoken(&self) -> Vec<Utterance> {
        lock(&self.spoken).clone()
    }

    pub fn fail_next(&self, message: &str) {
        *lock(&self.fail_next) = Some(message.to_string());
    }
}

impl SpeechEngine for FakeSpeech {
    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn speak(&self, utterance: Utterance) -> Result<(), String> {
        if let Some(e) = lock(&self.fail_next).take() {
            return Err(e);
        }
        lock(&self.spoken).push(utterance);
        Ok(())
    }
}

/// Shell that records which surfaces were opened.
#[derive(Default)]
pub struct RecordingShell {
    opened: Mutex<Vec<String>>,
}

impl RecordingShell {
    pub fn opened(&self) -> Vec<String> {
        lock(&self.opened).clone()
    }
}

impl Shell for RecordingShell {
    fn open_target_config(&self) {
        lock(&self.opened).push("targets".to_string());
    }

    fn open_server_directory(&self) {
        lock(&self.opened).push("servers".to_string());
    }

    fn open_url(&self, url: &str) -> Result<(), String> {
        lock(&self.opened).push(url.to_string());
        Ok(())
    }
}

/// Target store whose saves, once armed, must run outside async tasks.
#[derive(Default)]
pub struct OffRuntimeStore {
    inner: MemoryStore,
    armed: AtomicBool,
    saves: AtomicUsize,
}

impl OffRuntimeStore {
    pub fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl TargetStore for OffRuntimeStore {
    fn load(&self) -> Result<BTreeMap<String, bool>, StoreError> {
        self.inner.load()
    }

    fn save(&self, entries: &BTreeMap<String, bool>) -> Result<(), StoreError> {
        if self.armed.load(Ordering::SeqCst) {
            // Panics when called from an async worker.
            tokio::runtime::Handle::current().block_on(async {});
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.save(entries)
    }
}
