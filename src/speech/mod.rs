//! Completion ticket bridge for speech synthesis.
//!
//! A UI layer that can only make synchronous, polling calls asks for an
//! utterance and gets back an opaque ticket; the speech engine reports
//! completion asynchronously; the UI polls with the ticket until it reads
//! `true`. Each completion is consumed at most once.
//!
//! Tickets are decimal strings of a counter that starts at 1. The empty
//! string means "no ticket" (request rejected) and polls as done, so a
//! poller never spins on a rejected request.

pub mod espeak;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::SpeechError;
use crate::util::lock;

/// Voices whose name ends with this suffix need network access.
pub const NETWORK_VOICE_SUFFIX: &str = "-network";

/// Opaque completion ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TicketId(u64);

impl TicketId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TicketId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(TicketId)
    }
}

/// A synthesis voice offered by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Voice {
    pub name: String,
    /// Lowercase ISO 639 code, e.g. `ja`.
    pub language: String,
    /// Uppercase region code, e.g. `JP`, when the voice is regional.
    pub region: Option<String>,
    pub requires_network: bool,
}

/// One accepted request, handed to the engine.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub ticket: TicketId,
    pub text: String,
    pub voice: Voice,
    /// Relative volume in `0.0..=1.0`.
    pub volume: f32,
}

/// Speech synthesis collaborator.
///
/// `speak` only queues the utterance; completion is reported later through
/// [`TicketBridge::on_engine_completion`], from any thread.
pub trait SpeechEngine: Send + Sync {
    fn voices(&self) -> Vec<Voice>;
    fn speak(&self, utterance: Utterance) -> Result<(), String>;
}

/// Which voices are candidates: the configured language (and optionally
/// region), offline voices only.
#[derive(Debug, Clone)]
pub struct VoiceFilter {
    language: String,
    region: Option<String>,
}

impl VoiceFilter {
    pub fn new(language: &str, region: Option<&str>) -> Self {
        Self {
            language: language.to_string(),
            region: region.map(ToString::to_string),
        }
    }

    /// A voice matches when its language equals the filter language and its
    /// region is either absent or equal to the filter region.
    pub fn accepts(&self, voice: &Voice) -> bool {
        if voice.requires_network || voice.name.ends_with(NETWORK_VOICE_SUFFIX) {
            return false;
        }
        if !voice.language.eq_ignore_ascii_case(&self.language) {
            return false;
        }
        match (&voice.region, &self.region) {
            (None, _) => true,
            (Some(region), Some(wanted)) => region.eq_ignore_ascii_case(wanted),
            (Some(_), None) => false,
        }
    }
}

/// Issues tickets for utterances and records their completion.
pub struct TicketBridge {
    engine: Arc<dyn SpeechEngine>,
    filter: VoiceFilter,
    /// Filtered voices, cached once a non-empty list was seen.
    candidates: OnceLock<Vec<Voice>>,
    next_ticket: AtomicU64,
    completed: Mutex<HashSet<TicketId>>,
}

impl TicketBridge {
    pub fn new(engine: Arc<dyn SpeechEngine>, filter: VoiceFilter) -> Self {
        Self {
            engine,
            filter,
            candidates: OnceLock::new(),
            next_ticket: AtomicU64::new(1),
            completed: Mutex::new(HashSet::new()),
        }
    }

    fn candidates(&self) -> Vec<Voice> {
        if let Some(voices) = self.candidates.get() {
            return voices.clone();
        }
        let voices: Vec<Voice> = self
            .engine
            .voices()
            .into_iter()
            .filter(|v| self.filter.accepts(v))
            .collect();
        if !voices.is_empty() {
            let _ = self.candidates.set(voices.clone());
        }
        voices
    }

    /// Names of the candidate voices, in engine order.
    pub fn voice_names(&self) -> Vec<String> {
        self.candidates().into_iter().map(|v| v.name).collect()
    }

    /// Queue `text` and return its ticket, or the empty string if the request
    /// was rejected (no candidate voice, engine refused).
    pub fn submit(&self, text: &str, voice: Option<&str>, volume: f32) -> String {
        match self.try_submit(text, voice, volume) {
            Ok(ticket) => ticket.to_string(),
            Err(e) => {
                warn!("Speech: request rejected: {e}");
                String::new()
            }
        }
    }

    /// Typed form of [`submit`](Self::submit).
    ///
    /// An unknown voice name falls back to a random candidate.
    pub fn try_submit(
        &self,
        text: &str,
        voice: Option<&str>,
        volume: f32,
    ) -> Result<TicketId, SpeechError> {
        let candidates = self.candidates();
        let chosen = match voice.and_then(|name| candidates.iter().find(|v| v.name == name)) {
            Some(v) => v.clone(),
            None => {
                let v = candidates
                    .choose(&mut rand::thread_rng())
                    .ok_or(SpeechError::VoiceUnavailable)?
                    .clone();
                if let Some(name) = voice {
                    warn!("Speech: voice {name:?} not available, using {}", v.name);
                }
                v
            }
        };

        let ticket = TicketId(self.next_ticket.fetch_add(1, Ordering::SeqCst));
        debug!("Speech: ticket {ticket} -> voice {}", chosen.name);
        self.engine
            .speak(Utterance {
                ticket,
                text: text.to_string(),
                voice: chosen,
                volume: if volume.is_nan() { 1.0 } else { volume.clamp(0.0, 1.0) },
            })
            .map_err(SpeechError::Engine)?;
        Ok(ticket)
    }

    /// Record that the engine finished `ticket`. Safe from any thread.
    pub fn on_engine_completion(&self, ticket: TicketId) {
        if ticket.0 == 0 || ticket.0 >= self.next_ticket.load(Ordering::SeqCst) {
            warn!("Speech: completion for unknown ticket {ticket} ignored");
            return;
        }
        lock(&self.completed).insert(ticket);
        debug!("Speech: ticket {ticket} completed");
    }

    /// Poll a ticket. A completed ticket reads `true` exactly once; the
    /// empty ticket always reads `true`.
    pub fn is_done(&self, ticket: &str) -> bool {
        let ticket = ticket.trim();
        if ticket.is_empty() {
            return true;
        }
        match ticket.parse::<TicketId>() {
            Ok(id) => lock(&self.completed).remove(&id),
            Err(_) => {
                debug!("Speech: malformed ticket {ticket:?}");
                false
            }
        }
    }

    /// Completions recorded but not yet polled.
    pub fn pending_completions(&self) -> usize {
        lock(&self.completed).len()
    }
}
