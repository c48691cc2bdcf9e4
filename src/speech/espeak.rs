//! Speech engine backed by the `espeak-ng` command-line program.
//!
//! Voices are discovered once at startup from `espeak-ng --voices`. Each
//! utterance runs as its own child process; when the child exits (success or
//! not) the ticket's completion is pushed into the engine event queue.

use std::process::Stdio;

use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use super::{SpeechEngine, Utterance, Voice};
use crate::engine::EventSink;

/// Default `espeak-ng` amplitude; volume `1.0` maps here.
const FULL_AMPLITUDE: f32 = 100.0;

pub struct CommandSpeech {
    program: String,
    voices: Vec<Voice>,
    sink: EventSink,
    runtime: Handle,
}

impl CommandSpeech {
    /// Ask `program` for its voice list. Must be called inside a Tokio runtime.
    pub async fn discover(program: &str, sink: EventSink) -> std::io::Result<Self> {
        let output = Command::new(program)
            .arg("--voices")
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(std::io::Error::other(format!(
                "{program} --voices exited with {}",
                output.status
            )));
        }
        let voices = parse_voice_list(&String::from_utf8_lossy(&output.stdout));
        info!("Speech: {program} offers {} voices", voices.len());
        Ok(Self::with_voices(program, voices, sink))
    }

    /// An engine with a fixed voice list (empty when discovery failed).
    /// Must be called inside a Tokio runtime.
    pub fn with_voices(program: &str, voices: Vec<Voice>, sink: EventSink) -> Self {
        Self {
            program: program.to_string(),
            voices,
            sink,
            runtime: Handle::current(),
        }
    }
}

impl SpeechEngine for CommandSpeech {
    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn speak(&self, utterance: Utterance) -> Result<(), String> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("-v")
            .arg(&utterance.voice.name)
            .arg("-a")
            .arg(amplitude(utterance.volume).to_string())
            .arg("--")
            .arg(&utterance.text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let ticket = utterance.ticket;
        let sink = self.sink.clone();
        let program = self.program.clone();
        self.runtime.spawn(async move {
            match cmd.output().await {
                Ok(out) if out.status.success() => debug!("Speech: ticket {ticket} spoken"),
                Ok(out) => warn!(
                    "Speech: {program} exited with {} for ticket {ticket}: {}",
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                ),
                Err(e) => warn!("Speech: failed to run {program} for ticket {ticket}: {e}"),
            }
            // Pollers must terminate even when synthesis failed
            sink.utterance_done(ticket);
        });
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn amplitude(volume: f32) -> u32 {
    (volume.clamp(0.0, 1.0) * FULL_AMPLITUDE).round() as u32
}

/// Parse the table printed by `espeak-ng --voices`:
///
/// ```text
/// Pty Language       Age/Gender VoiceName          File                 Other Languages
///  5  ja              --/M      Japanese           jpx/ja
///  5  en-gb           --/M      English_(Great_Britain) gmw/en
/// ```
pub fn parse_voice_list(output: &str) -> Vec<Voice> {
    output
        .lines()
        .filter(|line| !line.trim_start().starts_with("Pty"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _priority = fields.next()?;
            let tag = fields.next()?;
            let _age_gender = fields.next()?;
            let name = fields.next()?;
            let (language, region) = match tag.split_once('-') {
                Some((lang, region)) => (lang, Some(region.to_ascii_uppercase())),
                None => (tag, None),
            };
            Some(Voice {
                name: name.to_string(),
                language: language.to_ascii_lowercase(),
                region,
                requires_network: false,
            })
        })
        .collect()
}
