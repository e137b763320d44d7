//! MIDI output backends
//!
//! Notes become MIDI note on/off pairs: [`MidiBackend`] implements the
//! instrument's [`VoiceBackend`] over any [`MidiOutput`], sending note on
//! when a voice starts and note off when it stops.

use crate::config::MidiSettings;
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use keytone_core::note::MIDI_OFFSET;
use keytone_core::{Note, Voice, VoiceBackend};
use std::sync::{Arc, Mutex, PoisonError};

/// MIDI message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MidiMessage {
    /// Note on: channel, note, velocity
    NoteOn { channel: u8, note: u8, velocity: u8 },
    /// Note off: channel, note
    NoteOff { channel: u8, note: u8 },
}

impl MidiMessage {
    /// Convert to raw MIDI bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            MidiMessage::NoteOn { channel, note, velocity } => {
                vec![0x90 | (channel & 0x0F), *note & 0x7F, *velocity & 0x7F]
            }
            MidiMessage::NoteOff { channel, note } => {
                vec![0x80 | (channel & 0x0F), *note & 0x7F, 0]
            }
        }
    }
}

/// MIDI output trait
pub trait MidiOutput: Send {
    /// Send a note on message
    fn note_on(&self, channel: u8, note: u8, velocity: u8);

    /// Send a note off message
    fn note_off(&self, channel: u8, note: u8);

    /// Get the port name
    fn port_name(&self) -> &str;

    /// Check if connected
    fn is_connected(&self) -> bool;
}

/// JACK MIDI output
pub struct JackMidiOutput {
    /// Sender for MIDI messages to the JACK process callback
    tx: Sender<MidiMessage>,
    /// Port name
    port_name: String,
    /// Keep the client alive
    client: jack::AsyncClient<(), JackMidiHandler>,
}

impl JackMidiOutput {
    /// Create a new JACK MIDI output
    pub fn new(client_name: &str, port_name: &str) -> Result<Self> {
        let (client, _status) =
            jack::Client::new(client_name, jack::ClientOptions::NO_START_SERVER)?;

        let midi_out = client.register_port(port_name, jack::MidiOut::default())?;

        let (tx, rx) = unbounded();
        let handler = JackMidiHandler { midi_out, rx };

        // Port names are only final once the client is registered
        let full_port_name = format!("{}:{}", client.name(), port_name);
        let client = client.activate_async((), handler)?;

        Ok(Self {
            tx,
            port_name: full_port_name,
            client,
        })
    }

    /// Create from settings
    pub fn from_settings(settings: &MidiSettings) -> Result<Self> {
        let output = Self::new(&settings.client_name, &settings.port_name)?;

        if let Some(ref destinations) = settings.auto_connect {
            for dest in destinations {
                if let Err(e) = output.connect_to(dest) {
                    log::warn!("Failed to auto-connect to {}: {}", dest, e);
                }
            }
        }

        Ok(output)
    }

    /// Connect to a JACK MIDI input port
    pub fn connect_to(&self, destination: &str) -> Result<()> {
        self.client
            .as_client()
            .connect_ports_by_name(&self.port_name, destination)?;
        log::info!("Connected {} -> {}", self.port_name, destination);
        Ok(())
    }
}

impl MidiOutput for JackMidiOutput {
    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        let _ = self.tx.send(MidiMessage::NoteOn { channel, note, velocity });
    }

    fn note_off(&self, channel: u8, note: u8) {
        let _ = self.tx.send(MidiMessage::NoteOff { channel, note });
    }

    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_connected(&self) -> bool {
        true
    }
}

/// JACK process handler for MIDI output
struct JackMidiHandler {
    midi_out: jack::Port<jack::MidiOut>,
    rx: Receiver<MidiMessage>,
}

impl jack::ProcessHandler for JackMidiHandler {
    fn process(&mut self, _client: &jack::Client, ps: &jack::ProcessScope) -> jack::Control {
        let mut writer = self.midi_out.writer(ps);

        while let Ok(msg) = self.rx.try_recv() {
            let bytes = msg.to_bytes();
            let raw = jack::RawMidi {
                time: 0, // Immediate
                bytes: &bytes,
            };
            let _ = writer.write(&raw);
        }

        jack::Control::Continue
    }
}

/// Dummy MIDI output (for testing or when JACK is not running)
pub struct DummyMidiOutput;

impl MidiOutput for DummyMidiOutput {
    fn note_on(&self, channel: u8, note: u8, velocity: u8) {
        log::debug!("MIDI Note On: ch={} note={} vel={}", channel, note, velocity);
    }

    fn note_off(&self, channel: u8, note: u8) {
        log::debug!("MIDI Note Off: ch={} note={}", channel, note);
    }

    fn port_name(&self) -> &str {
        "dummy"
    }

    fn is_connected(&self) -> bool {
        false
    }
}

type SharedOutput = Arc<Mutex<Box<dyn MidiOutput>>>;

fn with_output<R>(output: &SharedOutput, f: impl FnOnce(&dyn MidiOutput) -> R) -> R {
    let guard = output.lock().unwrap_or_else(PoisonError::into_inner);
    f(guard.as_ref())
}

/// Voice backend that plays notes on a MIDI output
pub struct MidiBackend {
    output: SharedOutput,
    name: String,
    channel: u8,
    velocity: u8,
}

impl MidiBackend {
    pub fn new(output: Box<dyn MidiOutput>, channel: u8, velocity: u8) -> Self {
        let name = output.port_name().to_string();
        Self {
            output: Arc::new(Mutex::new(output)),
            name,
            channel: channel.min(15),
            velocity: velocity.clamp(1, 127),
        }
    }

    /// JACK output if the server is running, otherwise the dummy output
    pub fn from_settings(settings: &MidiSettings) -> Self {
        let output: Box<dyn MidiOutput> = if is_jack_running() {
            match JackMidiOutput::from_settings(settings) {
                Ok(output) => {
                    log::info!("JACK MIDI output created: {}", output.port_name());
                    Box::new(output)
                }
                Err(e) => {
                    log::warn!("Failed to create JACK MIDI output: {}", e);
                    Box::new(DummyMidiOutput)
                }
            }
        } else {
            log::warn!("JACK is not running, MIDI output disabled");
            Box::new(DummyMidiOutput)
        };
        Self::new(output, settings.channel, settings.velocity)
    }

    pub fn is_connected(&self) -> bool {
        with_output(&self.output, |output| output.is_connected())
    }
}

struct MidiVoice {
    output: SharedOutput,
    channel: u8,
    note: u8,
}

impl Voice for MidiVoice {
    fn stop(&mut self) {
        with_output(&self.output, |output| output.note_off(self.channel, self.note));
    }
}

impl VoiceBackend for MidiBackend {
    fn start(&self, note: &Note) -> keytone_core::Result<Box<dyn Voice>> {
        let number = note.index().saturating_add(MIDI_OFFSET);
        if !(0..=127).contains(&number) {
            return Err(keytone_core::Error::Voice(format!(
                "{} is outside the MIDI note range",
                note
            )));
        }
        let number = number as u8;
        with_output(&self.output, |output| {
            output.note_on(self.channel, number, self.velocity)
        });
        Ok(Box::new(MidiVoice {
            output: self.output.clone(),
            channel: self.channel,
            note: number,
        }))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Check if JACK is running
pub fn is_jack_running() -> bool {
    jack::Client::new("keytone-check", jack::ClientOptions::NO_START_SERVER).is_ok()
}

/// List available JACK MIDI ports
pub fn list_jack_midi_ports() -> Result<Vec<String>> {
    let (client, _) = jack::Client::new("keytone-list", jack::ClientOptions::NO_START_SERVER)
        .map_err(|e| Error::Midi(format!("JACK is not running: {}", e)))?;
    Ok(client.ports(None, Some("midi"), jack::PortFlags::IS_INPUT))
}
