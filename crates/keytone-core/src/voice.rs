//! Voice backends
//!
//! An [`Instrument`](crate::Instrument) does not produce sound itself. It asks
//! a [`VoiceBackend`] to start a [`Voice`] for each note and stops that voice
//! when the note ends. Audio graph construction lives behind this seam.

use crate::error::Result;
use crate::note::Note;

/// A sounding tone.
pub trait Voice: Send {
    /// Silence the voice. Called at most once per voice.
    fn stop(&mut self);
}

/// Something that can start voices.
pub trait VoiceBackend: Send + Sync {
    /// Start sounding `note` immediately.
    fn start(&self, note: &Note) -> Result<Box<dyn Voice>>;

    /// Name for logs and status displays
    fn name(&self) -> &str;
}

/// Backend that only logs (useful for testing or when no output is available)
#[derive(Debug, Default, Clone, Copy)]
pub struct LogBackend;

struct LogVoice {
    label: String,
}

impl Voice for LogVoice {
    fn stop(&mut self) {
        log::debug!("Voice off: {}", self.label);
    }
}

impl VoiceBackend for LogBackend {
    fn start(&self, note: &Note) -> Result<Box<dyn Voice>> {
        let label = format!("{} ({:.2} Hz)", note, note.frequency());
        log::debug!("Voice on: {}", label);
        Ok(Box::new(LogVoice { label }))
    }

    fn name(&self) -> &str {
        "log"
    }
}
