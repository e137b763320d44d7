//! keytone-core - Command channel, timing context and voice orchestration.
//!
//! This crate provides the moving parts behind a keyboard-driven
//! instrument:
//!
//! - **Slots** - lowest-free-first handle allocation for voices and instruments
//! - **Protocol** - request/response messages with correlation ids
//! - **Registry** - the closed set of commands the timing context executes
//! - **Timing** - the background thread that owns note-off timers
//! - **Channel** - futures that resolve when the matching reply arrives
//! - **Instrument** - play/stop orchestration over a [`VoiceBackend`]
//!
//! # Architecture
//!
//! The foreground never sleeps to end a note. It sends `Note.stop` with a
//! delay to the timing thread and awaits the reply; the same path carries
//! manual releases with a zero delay, so every note ends through one funnel.
//!
//! ```no_run
//! use std::sync::Arc;
//! use keytone_core::{ChordKind, Chord, CommandChannel, Instrument, LogBackend, PitchClass, TimingConfig};
//!
//! # async fn demo() -> keytone_core::Result<()> {
//! let channel = Arc::new(CommandChannel::spawn(TimingConfig::default()));
//! let piano = Instrument::register(channel, Arc::new(LogBackend)).await?;
//!
//! // Sounds for 300ms, then the timing context stops it
//! piano.play(piano.create_note(PitchClass::C, 5, 300)).await?;
//!
//! // Held until released
//! let held = piano.play(Chord::new(piano.create_note(PitchClass::A, 4, -1), ChordKind::Minor)).await?;
//! for handle in held.handles() {
//!     piano.release(handle).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod instrument;
pub mod note;
pub mod protocol;
pub mod registry;
pub mod slots;
pub mod timing;
pub mod voice;

// Re-export main types
pub use channel::{CommandChannel, PendingReply, Predicate};
pub use error::{Error, Result};
pub use instrument::{Instrument, Played};
pub use note::{Chord, ChordKind, Note, PitchClass, Source};
pub use protocol::{Request, RequestId, Response, StopNotice};
pub use registry::{Command, CommandRegistry};
pub use slots::{Handle, SlotCollection};
pub use timing::{TimingConfig, TimingContext};
pub use voice::{LogBackend, Voice, VoiceBackend};
