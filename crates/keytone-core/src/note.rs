//! Notes and chords.
//!
//! Pitches are counted from A: index 0 is `A1` at the 27.5 Hz reference,
//! and each octave runs `A A# B C C# D D# E F F# G G#`. A note's octave
//! therefore changes at A, not at C.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Frequency of index 0 (A1 in this numbering) in Hz
pub const REFERENCE_FREQUENCY: f64 = 27.5;

/// MIDI note number of index 0
pub const MIDI_OFFSET: i32 = 21;

/// One of the twelve equal-tempered pitch classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PitchClass {
    A,
    ASharp,
    B,
    C,
    CSharp,
    D,
    DSharp,
    E,
    F,
    FSharp,
    G,
    GSharp,
}

impl PitchClass {
    pub const ALL: [PitchClass; 12] = [
        PitchClass::A,
        PitchClass::ASharp,
        PitchClass::B,
        PitchClass::C,
        PitchClass::CSharp,
        PitchClass::D,
        PitchClass::DSharp,
        PitchClass::E,
        PitchClass::F,
        PitchClass::FSharp,
        PitchClass::G,
        PitchClass::GSharp,
    ];

    /// Position within the octave, counted from A.
    pub fn index(self) -> i32 {
        self as i32
    }

    /// Pitch class at `index`, wrapping in both directions.
    pub fn from_index(index: i32) -> Self {
        Self::ALL[index.rem_euclid(12) as usize]
    }

    pub fn name(self) -> &'static str {
        match self {
            PitchClass::A => "A",
            PitchClass::ASharp => "A#",
            PitchClass::B => "B",
            PitchClass::C => "C",
            PitchClass::CSharp => "C#",
            PitchClass::D => "D",
            PitchClass::DSharp => "D#",
            PitchClass::E => "E",
            PitchClass::F => "F",
            PitchClass::FSharp => "F#",
            PitchClass::G => "G",
            PitchClass::GSharp => "G#",
        }
    }

    pub fn is_sharp(self) -> bool {
        self.name().ends_with('#')
    }
}

impl fmt::Display for PitchClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PitchClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s))
            .ok_or(Error::NotAcceptable {
                name: "pitch",
                index: 1,
                expected: "one of A A# B C C# D D# E F F# G G#",
            })
    }
}

/// A single pitched tone request.
///
/// `duration` of `None` means the note sounds until it is stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Note {
    pub pitch: PitchClass,
    pub octave: i32,
    pub duration: Option<Duration>,
}

impl Default for Note {
    fn default() -> Self {
        Self {
            pitch: PitchClass::C,
            octave: 3,
            duration: None,
        }
    }
}

impl Note {
    /// Create a note; a negative `duration_ms` means indefinite.
    pub fn new(pitch: PitchClass, octave: i32, duration_ms: i64) -> Self {
        Self {
            pitch,
            octave,
            duration: u64::try_from(duration_ms).ok().map(Duration::from_millis),
        }
    }

    /// Create a note from its absolute index.
    pub fn from_index(index: i32, duration: Option<Duration>) -> Self {
        Self {
            pitch: PitchClass::from_index(index),
            octave: index.div_euclid(12) + 1,
            duration,
        }
    }

    pub fn with_duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    /// Absolute index counted in semitones from A1, saturating at the
    /// `i32` bounds for absurd octaves.
    pub fn index(&self) -> i32 {
        self.octave
            .saturating_sub(1)
            .saturating_mul(12)
            .saturating_add(self.pitch.index())
    }

    pub fn frequency(&self) -> f64 {
        REFERENCE_FREQUENCY * 2f64.powf(self.index() as f64 / 12.0)
    }

    /// MIDI note number, clamped to 0..=127.
    pub fn midi_note(&self) -> u8 {
        self.index().saturating_add(MIDI_OFFSET).clamp(0, 127) as u8
    }

    /// Duration in whole milliseconds, as sent on the wire.
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration.map(|d| d.as_millis() as u64)
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.pitch, self.octave)
    }
}

impl FromStr for Note {
    type Err = Error;

    /// Parse `"C#5"`-style names into an indefinite note.
    fn from_str(s: &str) -> Result<Self> {
        let split = s
            .find(|c: char| c == '-' || c.is_ascii_digit())
            .ok_or(Error::NotAcceptable {
                name: "note",
                index: 1,
                expected: "a pitch followed by an octave, e.g. C#5",
            })?;
        let pitch = s[..split].parse()?;
        let octave = s[split..].parse().map_err(|_| Error::NotAcceptable {
            name: "octave",
            index: 1,
            expected: "an integer",
        })?;
        Ok(Self {
            pitch,
            octave,
            duration: None,
        })
    }
}

/// Chord shapes as semitone offsets from the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChordKind {
    Major,
    Minor,
    Sus2,
    Sus4,
    Aug,
}

impl ChordKind {
    pub fn offsets(self) -> &'static [i32] {
        match self {
            ChordKind::Major => &[0, 4, 7],
            ChordKind::Minor => &[0, 3, 7],
            ChordKind::Sus2 => &[0, 2, 7],
            ChordKind::Sus4 => &[0, 5, 7],
            ChordKind::Aug => &[0, 4, 8],
        }
    }
}

/// Notes sounding together, built from a root and semitone offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chord {
    pub root: Note,
    pub notes: Vec<Note>,
}

impl Chord {
    pub fn new(root: Note, kind: ChordKind) -> Self {
        Self::from_offsets(root, kind.offsets())
    }

    /// Every constituent inherits the root's duration.
    pub fn from_offsets(root: Note, offsets: &[i32]) -> Self {
        let notes = offsets
            .iter()
            .map(|offset| Note::from_index(root.index().saturating_add(*offset), root.duration))
            .collect();
        Self { root, notes }
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.notes.iter().map(Note::to_string).collect();
        write!(f, "[{}]", names.join(" "))
    }
}

/// What [`Instrument::play`](crate::Instrument::play) accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Note(Note),
    Chord(Chord),
}

impl From<Note> for Source {
    fn from(note: Note) -> Self {
        Source::Note(note)
    }
}

impl From<Chord> for Source {
    fn from(chord: Chord) -> Self {
        Source::Chord(chord)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frequencies() {
        let a5 = Note::new(PitchClass::A, 5, -1);
        assert!((a5.frequency() - 440.0).abs() < 1e-9);

        let c5 = Note::new(PitchClass::C, 5, -1);
        assert!((c5.frequency() - 523.2511).abs() < 1e-3);

        assert!((Note::from_index(0, None).frequency() - REFERENCE_FREQUENCY).abs() < 1e-12);
    }

    #[test]
    fn test_midi_numbers() {
        assert_eq!(Note::new(PitchClass::A, 5, -1).midi_note(), 69);
        assert_eq!(Note::new(PitchClass::C, 5, -1).midi_note(), 72);
        assert_eq!(Note::from_index(0, None).midi_note(), 21);
    }

    #[test]
    fn test_extreme_octaves_saturate() {
        let high = Note::new(PitchClass::GSharp, i32::MAX, -1);
        assert_eq!(high.index(), i32::MAX);
        assert_eq!(high.midi_note(), 127);

        let low = Note::new(PitchClass::A, i32::MIN, -1);
        assert_eq!(low.index(), i32::MIN);
        assert_eq!(low.midi_note(), 0);

        assert_eq!(Chord::new(high, ChordKind::Major).notes.len(), 3);
    }

    #[test]
    fn test_duration_sign() {
        assert_eq!(Note::new(PitchClass::C, 3, -1).duration, None);
        assert_eq!(Note::new(PitchClass::C, 3, 0).duration, Some(Duration::ZERO));
        assert_eq!(Note::new(PitchClass::C, 3, 250).duration_ms(), Some(250));
    }

    #[test]
    fn test_index_round_trip() {
        for index in [0, 3, 11, 12, 51, 87] {
            assert_eq!(Note::from_index(index, None).index(), index);
        }
        let b = Note::from_index(2, None);
        assert_eq!((b.pitch, b.octave), (PitchClass::B, 1));
        let c = Note::from_index(15, None);
        assert_eq!((c.pitch, c.octave), (PitchClass::C, 2));
    }

    #[test]
    fn test_identity_ignores_duration() {
        let short = Note::new(PitchClass::CSharp, 5, 100);
        let held = Note::new(PitchClass::CSharp, 5, -1);
        assert_eq!(short.to_string(), "C#5");
        assert_eq!(short.to_string(), held.to_string());
    }

    #[test]
    fn test_parse() {
        let note: Note = "C#5".parse().unwrap();
        assert_eq!(note, Note::new(PitchClass::CSharp, 5, -1));
        let low: Note = "a-1".parse().unwrap();
        assert_eq!((low.pitch, low.octave), (PitchClass::A, -1));
        assert!("H2".parse::<Note>().is_err());
        assert!("C".parse::<Note>().is_err());
    }

    #[test]
    fn test_major_chord() {
        let root = Note::new(PitchClass::C, 5, 300);
        let chord = Chord::new(root, ChordKind::Major);
        assert_eq!(chord.to_string(), "[C5 E5 G5]");
        assert!(chord.notes.iter().all(|n| n.duration == root.duration));
    }

    #[test]
    fn test_chord_crosses_octave_at_a() {
        // G5 + 4 semitones is B6: the octave number turns over at A
        let chord = Chord::new(Note::new(PitchClass::G, 5, -1), ChordKind::Major);
        assert_eq!(chord.to_string(), "[G5 B6 D6]");
    }
}
