//! Configuration file support for keytone-keys
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/keytone-keys/config.toml`
//! - macOS: `~/Library/Application Support/keytone-keys/config.toml`
//! - Windows: `%APPDATA%\keytone-keys\config.toml`

use crate::error::{Error, Result};
use crate::keyboard::{
    KeyMapping, KeyboardConfig, DEFAULT_AUTO_RELEASE_MS, DEFAULT_BASE_OCTAVE, DEFAULT_NOTE_MS,
    MAX_BASE_OCTAVE, MIN_BASE_OCTAVE,
};
use directories::ProjectDirs;
use keytone_core::timing::DEFAULT_POLL_INTERVAL_MS;
use keytone_core::{ChordKind, PitchClass, TimingConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default velocity for key presses
pub const DEFAULT_VELOCITY: u8 = 100;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Keyboard configuration
    pub keyboard: KeyboardSettings,
    /// MIDI configuration
    pub midi: MidiSettings,
    /// Timing context configuration
    pub timing: TimingSettings,
    /// UI/Theme configuration
    pub theme: Theme,
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Save configuration to the default config file location
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "keytone-keys") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = r#"# keytone-keys configuration file

[keyboard]
# Keyboard layout: "us", "german", or "custom"
layout = "us"

# Octave played by the lowest key (z on US keyboards)
base_octave = 5

# Note length in milliseconds, -1 holds notes until the key is released
note_ms = -1

# Note length used when the terminal cannot report key releases
auto_release_ms = 400

# Chord played by shifted keys: "major", "minor", "sus2", "sus4" or "aug"
chord = "major"

# Custom mappings (only used when layout = "custom")
# [[keyboard.custom_mappings]]
# key = "a"
# pitch = "C"
# octave_offset = 0

[midi]
# JACK client name
client_name = "keytone-keys"

# MIDI output port name
port_name = "midi_out"

# MIDI channel (0-15)
channel = 0

# Velocity (1-127)
velocity = 100

# Auto-connect to these JACK MIDI inputs (optional)
# auto_connect = ["a2j:Hydrogen"]

[timing]
# Upper bound in milliseconds on how long the timing thread sleeps
tick_ms = 50

[theme]
pressed_key_color = "cyan"
border_color = "cyan"
show_help = true
"#;

        fs::write(&path, content)?;
        Ok(path)
    }

    /// Convert to KeyboardConfig for the keyboard module
    pub fn to_keyboard_config(&self) -> Result<KeyboardConfig> {
        let mappings = match self.keyboard.layout {
            KeyboardLayout::German => KeyboardConfig::german_layout().mappings,
            KeyboardLayout::Us => KeyboardConfig::us_layout().mappings,
            KeyboardLayout::Custom => match self.keyboard.custom_mappings {
                Some(ref mappings) => mappings
                    .iter()
                    .map(CustomKeyMapping::to_key_mapping)
                    .collect::<Result<Vec<_>>>()?,
                None => {
                    return Err(Error::Config(
                        "layout = \"custom\" needs keyboard.custom_mappings".to_string(),
                    ))
                }
            },
        };

        let base_octave = self
            .keyboard
            .base_octave
            .clamp(MIN_BASE_OCTAVE, MAX_BASE_OCTAVE);
        if base_octave != self.keyboard.base_octave {
            log::warn!(
                "base_octave {} out of range, using {}",
                self.keyboard.base_octave,
                base_octave
            );
        }

        Ok(KeyboardConfig {
            mappings,
            base_octave,
            note_ms: self.keyboard.note_ms,
            chord: self.keyboard.chord,
        })
    }
}

/// Keyboard layout preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyboardLayout {
    /// US QWERTY layout
    #[default]
    Us,
    /// German QWERTZ layout
    German,
    /// Custom layout (use custom_mappings)
    Custom,
}

/// Keyboard settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyboardSettings {
    /// Keyboard layout preset
    pub layout: KeyboardLayout,
    /// Octave played by the lowest key
    pub base_octave: i32,
    /// Note length in milliseconds, negative holds until release
    pub note_ms: i64,
    /// Note length used when key releases are not reported
    pub auto_release_ms: u64,
    /// Chord played by shifted keys
    pub chord: ChordKind,
    /// Custom key mappings (only used when layout = "custom")
    pub custom_mappings: Option<Vec<CustomKeyMapping>>,
}

impl Default for KeyboardSettings {
    fn default() -> Self {
        Self {
            layout: KeyboardLayout::Us,
            base_octave: DEFAULT_BASE_OCTAVE,
            note_ms: DEFAULT_NOTE_MS,
            auto_release_ms: DEFAULT_AUTO_RELEASE_MS,
            chord: ChordKind::Major,
            custom_mappings: None,
        }
    }
}

/// Custom key mapping for TOML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomKeyMapping {
    /// The key character
    pub key: char,
    /// Display character (optional, defaults to uppercase of key)
    pub display: Option<char>,
    /// Pitch class name, e.g. "C#"
    pub pitch: String,
    /// Octave offset from the current octave
    #[serde(default)]
    pub octave_offset: i32,
}

impl CustomKeyMapping {
    /// Convert to KeyMapping
    pub fn to_key_mapping(&self) -> Result<KeyMapping> {
        let pitch: PitchClass = self.pitch.parse().map_err(|_| {
            Error::Config(format!(
                "Unknown pitch {:?} for key {:?}",
                self.pitch, self.key
            ))
        })?;
        let key_char = self.key.to_lowercase().next().unwrap_or(self.key);
        Ok(KeyMapping {
            key_char,
            display_char: self
                .display
                .unwrap_or_else(|| self.key.to_uppercase().next().unwrap_or(self.key)),
            pitch,
            octave_offset: self.octave_offset,
        })
    }
}

/// MIDI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiSettings {
    /// JACK client name
    pub client_name: String,
    /// MIDI output port name
    pub port_name: String,
    /// MIDI channel (0-15)
    pub channel: u8,
    /// Velocity (1-127)
    pub velocity: u8,
    /// Auto-connect to these JACK MIDI inputs
    pub auto_connect: Option<Vec<String>>,
}

impl Default for MidiSettings {
    fn default() -> Self {
        Self {
            client_name: "keytone-keys".to_string(),
            port_name: "midi_out".to_string(),
            channel: 0,
            velocity: DEFAULT_VELOCITY,
            auto_connect: None,
        }
    }
}

/// Timing context settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingSettings {
    /// Upper bound on how long the timing thread sleeps between checks
    pub tick_ms: u64,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            tick_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl TimingSettings {
    pub fn to_timing_config(&self) -> TimingConfig {
        TimingConfig {
            poll_interval: Duration::from_millis(self.tick_ms.max(1)),
        }
    }
}

/// Theme/UI settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Theme {
    /// Pressed key color
    pub pressed_key_color: String,
    /// Border color
    pub border_color: String,
    /// Show help text
    pub show_help: bool,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            pressed_key_color: "cyan".to_string(),
            border_color: "cyan".to_string(),
            show_help: true,
        }
    }
}

impl Theme {
    /// Parse a color string to ratatui Color
    pub fn parse_color(s: &str) -> ratatui::style::Color {
        use ratatui::style::Color;
        match s.to_lowercase().as_str() {
            "black" => Color::Black,
            "red" => Color::Red,
            "green" => Color::Green,
            "yellow" => Color::Yellow,
            "blue" => Color::Blue,
            "magenta" => Color::Magenta,
            "cyan" => Color::Cyan,
            "gray" | "grey" => Color::Gray,
            "dark_gray" | "dark_grey" | "darkgray" | "darkgrey" => Color::DarkGray,
            "light_red" | "lightred" => Color::LightRed,
            "light_green" | "lightgreen" => Color::LightGreen,
            "light_yellow" | "lightyellow" => Color::LightYellow,
            "light_blue" | "lightblue" => Color::LightBlue,
            "light_magenta" | "lightmagenta" => Color::LightMagenta,
            "light_cyan" | "lightcyan" => Color::LightCyan,
            "white" => Color::White,
            // Byte slicing below needs an ASCII string
            s if s.starts_with('#') && s.len() == 7 && s.is_ascii() => {
                match (
                    u8::from_str_radix(&s[1..3], 16),
                    u8::from_str_radix(&s[3..5], 16),
                    u8::from_str_radix(&s[5..7], 16),
                ) {
                    (Ok(r), Ok(g), Ok(b)) => Color::Rgb(r, g, b),
                    _ => Color::White,
                }
            }
            _ => Color::White,
        }
    }

    /// Get pressed key color
    pub fn pressed_key(&self) -> ratatui::style::Color {
        Self::parse_color(&self.pressed_key_color)
    }

    /// Get border color
    pub fn border(&self) -> ratatui::style::Color {
        Self::parse_color(&self.border_color)
    }
}
