//! keytone-keys - Terminal keyboard instrument for keytone
//!
//! Play notes and chords from the computer keyboard. Each key press becomes
//! an [`Instrument::play`](keytone_core::Instrument::play) call; releases go
//! through the instrument's timing context like every other note ending.
//!
//! - Multiple keyboard layouts (US QWERTY, German QWERTZ, or custom)
//! - Shifted keys play chords
//! - JACK MIDI output
//! - Configurable via TOML file
//!
//! # Usage as a Library
//!
//! ```no_run
//! use keytone_keys::{Config, VirtualKeyboard};
//!
//! let config = Config::load_or_default();
//! let mut keyboard = VirtualKeyboard::new(config.to_keyboard_config().unwrap());
//!
//! // Handle key events (uses char, not KeyCode)
//! if let Some(press) = keyboard.key_down('z') {
//!     println!("Play {} as {:?}", press.identity, press.source);
//! }
//! ```

pub mod config;
pub mod error;
pub mod keyboard;
pub mod midi;
pub mod ui;

// Re-export main types
pub use config::{Config, KeyboardLayout, Theme};
pub use error::{Error, Result};
pub use keyboard::{Held, KeyMapping, KeyPress, KeyTracker, KeyboardConfig, VirtualKeyboard};
pub use midi::{DummyMidiOutput, JackMidiOutput, MidiBackend, MidiOutput};
pub use ui::{render_status, EventLog, StatusView};
