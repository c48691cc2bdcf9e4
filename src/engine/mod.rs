//! Engine boundary.
//!
//! [`Engine`] is the set of calls the core makes into the packet-forwarding
//! engine. The engine answers asynchronously from its own threads by pushing
//! [`EngineEvent`]s into an [`EventSink`]; sending never blocks and works from
//! any thread. A single consumer, [`EventQueue`], drains the events into the
//! directory synchronizer and the speech ticket bridge, so the foreground
//! never waits on an engine thread and engine threads never wait on the UI.

pub mod local;

use std::os::fd::RawFd;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::directory::{DirectorySync, ServerDescriptor};
use crate::speech::{TicketBridge, TicketId};

/// Calls consumed from the packet-forwarding engine.
///
/// Every method must return promptly; long-running work belongs on the
/// engine's own threads.
pub trait Engine: Send + Sync {
    /// Start forwarding on `tun_fd`. Ownership of the descriptor passes to
    /// the engine, which closes it when halted.
    fn establish(&self, config_path: &Path, tun_fd: RawFd) -> Result<(), String>;
    /// Stop forwarding. Halting a stopped engine is a no-op.
    fn halt(&self);
    fn is_running(&self) -> bool;
    /// Re-enumerate candidate servers and start latency probes.
    fn enumerate_servers(&self);
    fn selected_server(&self) -> Option<ServerDescriptor>;
    fn set_selected_server(&self, server: &ServerDescriptor);
    /// Where to push directory snapshots; `None` stops pushing.
    fn register_directory_observer(&self, sink: Option<EventSink>);
}

/// Something the engine reports back to the core.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Full replacement of the candidate server list.
    Snapshot(Vec<ServerDescriptor>),
    /// A speech utterance finished.
    UtteranceDone(TicketId),
}

/// Engine-side handle of the event queue. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventSink {
    /// Enqueue an event. Returns `false` once the consumer is gone.
    pub fn send(&self, event: EngineEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(e) => {
                debug!("Engine events: consumer gone, dropping {:?}", e.0);
                false
            }
        }
    }

    pub fn snapshot(&self, servers: Vec<ServerDescriptor>) -> bool {
        self.send(EngineEvent::Snapshot(servers))
    }

    pub fn utterance_done(&self, ticket: TicketId) -> bool {
        self.send(EngineEvent::UtteranceDone(ticket))
    }
}

/// Consumer side of the event queue.
pub struct EventQueue {
    rx: mpsc::UnboundedReceiver<EngineEvent>,
}

/// Create a connected sink/queue pair.
pub fn event_channel() -> (EventSink, EventQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, EventQueue { rx })
}

impl EventQueue {
    /// Drain events until every sink is dropped.
    pub async fn run(mut self, directory: Arc<DirectorySync>, speech: Arc<TicketBridge>) {
        while let Some(event) = self.recv().await {
            dispatch(&directory, &speech, event);
        }
        debug!("Engine events: all sinks dropped, dispatcher exiting");
    }

    /// Wait for the next event; `None` once every sink is dropped.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        self.rx.recv().await
    }

    /// Spawn [`run`](Self::run) on the current Tokio runtime.
    pub fn spawn(self, directory: Arc<DirectorySync>, speech: Arc<TicketBridge>) -> JoinHandle<()> {
        tokio::spawn(self.run(directory, speech))
    }

    /// Apply every event queued so far without waiting. Returns how many
    /// events were applied.
    pub fn drain(&mut self, directory: &DirectorySync, speech: &TicketBridge) -> usize {
        let mut applied = 0;
        while let Ok(event) = self.rx.try_recv() {
            dispatch(directory, speech, event);
            applied += 1;
        }
        applied
    }
}

fn dispatch(directory: &DirectorySync, speech: &TicketBridge, event: EngineEvent) {
    match event {
        EngineEvent::Snapshot(servers) => directory.on_snapshot(servers),
        EngineEvent::UtteranceDone(ticket) => speech.on_engine_completion(ticket),
    }
}

/// Write the default engine configuration (an access-control list that
/// proxies everything) unless a file is already present. Returns whether a
/// file was written.
pub fn write_default_engine_config(path: &Path) -> std::io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, DEFAULT_ENGINE_CONFIG)?;
    Ok(true)
}

const DEFAULT_ENGINE_CONFIG: &str = "[proxy_all]\n\n[bypass_list]\n127.0.0.0/8\n10.0.0.0/8\n";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::speech::VoiceFilter;
    use crate::testing::{server, voice, FakeEngine, FakeSpeech};

    fn parts() -> (Arc<DirectorySync>, Arc<TicketBridge>) {
        let engine = Arc::new(FakeEngine::default());
        let speech = Arc::new(FakeSpeech::with_voices(vec![voice("ja-1", "ja", Some("JP"))]));
        (
            Arc::new(DirectorySync::new(engine)),
            Arc::new(TicketBridge::new(speech, VoiceFilter::new("ja", Some("JP")))),
        )
    }

    #[test]
    fn test_drain_applies_events_in_order() {
        let (directory, speech) = parts();
        let (sink, mut queue) = event_channel();

        let ticket = speech.try_submit("konnichiwa", None, 1.0).unwrap();
        assert!(sink.snapshot(vec![server("a", "10.1.0.1", 1)]));
        assert!(sink.snapshot(vec![server("b", "10.1.0.2", 2)]));
        assert!(sink.utterance_done(ticket));

        assert_eq!(queue.drain(&directory, &speech), 3);
        assert_eq!(directory.servers()[0].name, "b");
        assert_eq!(directory.snapshots_applied(), 2);
        assert!(speech.is_done(&ticket.to_string()));
    }

    #[test]
    fn test_send_after_queue_dropped_reports_false() {
        let (sink, queue) = event_channel();
        drop(queue);
        assert!(!sink.snapshot(Vec::new()));
    }

    #[tokio::test]
    async fn test_run_consumes_events_from_other_threads() {
        let (directory, speech) = parts();
        let (sink, queue) = event_channel();
        let task = queue.spawn(Arc::clone(&directory), Arc::clone(&speech));

        let producer = std::thread::spawn(move || {
            for port in 1..=5u16 {
                sink.snapshot(vec![server("s", "10.1.0.1", port)]);
            }
        });
        producer.join().unwrap();

        // The sink moved into the producer thread is gone, so run() finishes
        task.await.unwrap();
        assert_eq!(directory.snapshots_applied(), 5);
        assert_eq!(directory.servers()[0].port, 5);
    }

    #[test]
    fn test_default_engine_config_written_once() {
        let dir = std::env::temp_dir().join(format!("surfbridge-engine-{}", uuid::Uuid::new_v4()));
        let path = dir.join("acl.txt");
        assert!(write_default_engine_config(&path).unwrap());
        std::fs::write(&path, "[bypass_all]\n").unwrap();
        assert!(!write_default_engine_config(&path).unwrap());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "[bypass_all]\n");
        let _ = std::fs::remove_dir_all(dir);
    }
}
