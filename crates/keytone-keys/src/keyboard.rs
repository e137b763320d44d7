//! Virtual keyboard
//!
//! Maps computer keys to pitch classes and tracks which notes are held, so
//! that a key release can find the handles its press produced. Supports
//! multiple keyboard layouts and octave shifting.

use keytone_core::{Chord, ChordKind, Handle, Note, PitchClass, Source};
use std::collections::HashMap;

/// Octave the lowest key plays without any shift
pub const DEFAULT_BASE_OCTAVE: i32 = 5;

/// Notes are held until the key is released
pub const DEFAULT_NOTE_MS: i64 = -1;

/// Note length used when the terminal reports no key releases.
/// Must be longer than the OS key repeat delay (typically 300-500ms)
pub const DEFAULT_AUTO_RELEASE_MS: u64 = 400;

/// Octave shift is clamped to this many octaves either way
pub const MAX_OCTAVE_SHIFT: i32 = 3;

/// Range accepted for the base octave from the config file or command line
pub const MIN_BASE_OCTAVE: i32 = -1;
pub const MAX_BASE_OCTAVE: i32 = 10;

/// A key mapping entry: computer key character -> pitch class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMapping {
    /// The character representing this key (lowercase)
    pub key_char: char,
    /// The character to display (for rendering, usually uppercase)
    pub display_char: char,
    /// Pitch class this key plays
    pub pitch: PitchClass,
    /// Octave offset from the current octave
    pub octave_offset: i32,
}

impl KeyMapping {
    fn new(key_char: char, pitch: PitchClass, octave_offset: i32) -> Self {
        Self {
            key_char,
            display_char: key_char.to_uppercase().next().unwrap_or(key_char),
            pitch,
            octave_offset,
        }
    }
}

/// Virtual keyboard configuration
#[derive(Debug, Clone)]
pub struct KeyboardConfig {
    /// Key mappings (computer key -> note info)
    pub mappings: Vec<KeyMapping>,
    /// Octave played by mappings with no offset
    pub base_octave: i32,
    /// Note length in milliseconds; negative holds until release
    pub note_ms: i64,
    /// Chord played by shifted keys
    pub chord: ChordKind,
}

impl Default for KeyboardConfig {
    fn default() -> Self {
        Self::us_layout()
    }
}

impl KeyboardConfig {
    /// Create a US QWERTY keyboard layout configuration
    ///
    /// One and a half octaves on the two lower rows. Pitches are counted
    /// from A, so the octave number turns over at the `n` key:
    /// ```text
    ///     S   D       G   H   J       L   ;
    ///     C#5 D#5     F#5 G#5 A#6     C#6 D#6
    ///   Z   X   C   V   B   N   M   ,   .   /   \
    ///   C5  D5  E5  F5  G5  A6  B6  C6  D6  E6  F6
    /// ```
    pub fn us_layout() -> Self {
        use PitchClass::*;
        let mappings = vec![
            KeyMapping::new('z', C, 0),
            KeyMapping::new('s', CSharp, 0),
            KeyMapping::new('x', D, 0),
            KeyMapping::new('d', DSharp, 0),
            KeyMapping::new('c', E, 0),
            KeyMapping::new('v', F, 0),
            KeyMapping::new('g', FSharp, 0),
            KeyMapping::new('b', G, 0),
            KeyMapping::new('h', GSharp, 0),
            KeyMapping::new('n', A, 1),
            KeyMapping::new('j', ASharp, 1),
            KeyMapping::new('m', B, 1),
            KeyMapping::new(',', C, 1),
            KeyMapping::new('l', CSharp, 1),
            KeyMapping::new('.', D, 1),
            KeyMapping::new(';', DSharp, 1),
            KeyMapping::new('/', E, 1),
            KeyMapping::new('\\', F, 1),
        ];

        Self {
            mappings,
            base_octave: DEFAULT_BASE_OCTAVE,
            note_ms: DEFAULT_NOTE_MS,
            chord: ChordKind::Major,
        }
    }

    /// Create a German QWERTZ keyboard layout configuration
    ///
    /// Same physical keys as the US layout: `y` sits where `z` is, and the
    /// right-hand keys are `ö`, `-` and `<`.
    pub fn german_layout() -> Self {
        let mut config = Self::us_layout();
        for mapping in config.mappings.iter_mut() {
            let key = match mapping.key_char {
                'z' => 'y',
                ';' => 'ö',
                '/' => '-',
                '\\' => '<',
                other => other,
            };
            *mapping = KeyMapping::new(key, mapping.pitch, mapping.octave_offset);
        }
        config
    }

    /// Get the mapping for a given key character
    pub fn get_mapping(&self, c: char) -> Option<&KeyMapping> {
        let c = lowercase(c);
        self.mappings.iter().find(|m| m.key_char == c)
    }

    /// Check if a character is part of the keyboard
    pub fn is_keyboard_char(&self, c: char) -> bool {
        self.get_mapping(c).is_some()
    }

    /// All mappings from lowest to highest pitch
    pub fn sorted_mappings(&self) -> Vec<&KeyMapping> {
        let mut keys: Vec<_> = self.mappings.iter().collect();
        keys.sort_by_key(|m| m.octave_offset.saturating_mul(12).saturating_add(m.pitch.index()));
        keys
    }
}

fn lowercase(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

/// Held state of one note identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Held {
    /// Play was requested and has not resolved yet
    Pending,
    /// Voices are sounding under these handles
    Sounding(Vec<Handle>),
}

/// Tracks held notes by identity string (`"C#5"`, or `"[C5 E5 G5]"` for a
/// chord), so the same note is never started twice.
#[derive(Debug, Clone, Default)]
pub struct KeyTracker {
    held: HashMap<String, Held>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `identity` as pending. Returns false if it is already held.
    pub fn press(&mut self, identity: &str) -> bool {
        if self.held.contains_key(identity) {
            return false;
        }
        self.held.insert(identity.to_string(), Held::Pending);
        true
    }

    /// Record the handles a pending play produced.
    ///
    /// Returns false when the note was released before its play resolved;
    /// the caller then owns `handles` and has to release them.
    pub fn sounding(&mut self, identity: &str, handles: Vec<Handle>) -> bool {
        match self.held.get_mut(identity) {
            Some(state @ Held::Pending) => {
                *state = Held::Sounding(handles);
                true
            }
            _ => false,
        }
    }

    /// Forget `identity`, returning its handles if it was sounding.
    pub fn release(&mut self, identity: &str) -> Option<Vec<Handle>> {
        match self.held.remove(identity)? {
            Held::Sounding(handles) => Some(handles),
            Held::Pending => None,
        }
    }

    /// A play for `identity` ended on its own (finite note or failure).
    pub fn finished(&mut self, identity: &str) {
        if self.held.get(identity) == Some(&Held::Pending) {
            self.held.remove(identity);
        }
    }

    /// Forget everything, returning every sounding handle.
    pub fn clear(&mut self) -> Vec<Handle> {
        self.held
            .drain()
            .flat_map(|(_, state)| match state {
                Held::Sounding(handles) => handles,
                Held::Pending => Vec::new(),
            })
            .collect()
    }

    pub fn is_held(&self, identity: &str) -> bool {
        self.held.contains_key(identity)
    }

    pub fn state(&self, identity: &str) -> Option<&Held> {
        self.held.get(identity)
    }

    /// Held identities, sorted for display
    pub fn identities(&self) -> Vec<&str> {
        let mut identities: Vec<&str> = self.held.keys().map(String::as_str).collect();
        identities.sort_unstable();
        identities
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

/// A key press that should start playing
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPress {
    /// Lowercase key that was pressed
    pub key: char,
    /// Identity under which the press is tracked
    pub identity: String,
    /// What to play
    pub source: Source,
}

impl KeyPress {
    /// True when the notes end on their own after `note_ms`.
    pub fn is_finite(&self) -> bool {
        match &self.source {
            Source::Note(note) => note.duration.is_some(),
            Source::Chord(chord) => chord.root.duration.is_some(),
        }
    }
}

/// Virtual keyboard state
#[derive(Debug, Clone)]
pub struct VirtualKeyboard {
    /// Configuration
    pub config: KeyboardConfig,
    /// Octave shift (applied on top of base_octave)
    pub octave_shift: i32,
    tracker: KeyTracker,
    /// Map from key to the identity its press is tracked under
    key_to_note: HashMap<char, String>,
}

impl Default for VirtualKeyboard {
    fn default() -> Self {
        Self::new(KeyboardConfig::default())
    }
}

impl VirtualKeyboard {
    /// Create a new virtual keyboard with the given configuration
    pub fn new(config: KeyboardConfig) -> Self {
        Self {
            config,
            octave_shift: 0,
            tracker: KeyTracker::new(),
            key_to_note: HashMap::new(),
        }
    }

    /// Octave played by mappings with no offset, shift applied
    pub fn octave(&self) -> i32 {
        self.config.base_octave.saturating_add(self.octave_shift)
    }

    /// Get the current octave display name (e.g., "C5")
    pub fn octave_name(&self) -> String {
        format!("C{}", self.octave())
    }

    /// The note a mapping plays at the current octave
    pub fn note_for_mapping(&self, mapping: &KeyMapping) -> Note {
        Note::new(
            mapping.pitch,
            self.octave().saturating_add(mapping.octave_offset),
            self.config.note_ms,
        )
    }

    /// Get the note for a key character (with octave shift applied)
    pub fn get_note_for_char(&self, c: char) -> Option<Note> {
        self.config.get_mapping(c).map(|m| self.note_for_mapping(m))
    }

    /// Handle a key press.
    ///
    /// An uppercase key plays a chord on its note. Returns None for unmapped
    /// keys, key repeats and notes that are already held.
    pub fn key_down(&mut self, c: char) -> Option<KeyPress> {
        let mapping = self.config.get_mapping(c)?;
        let key = mapping.key_char;
        if self.key_to_note.contains_key(&key) {
            return None;
        }

        let note = self.note_for_mapping(mapping);
        let (identity, source) = if c != key && c.is_uppercase() {
            let chord = Chord::new(note, self.config.chord);
            (chord.to_string(), Source::from(chord))
        } else {
            (note.to_string(), Source::from(note))
        };

        if !self.tracker.press(&identity) {
            return None;
        }
        self.key_to_note.insert(key, identity.clone());
        Some(KeyPress {
            key,
            identity,
            source,
        })
    }

    /// Handle a key release.
    ///
    /// Returns the handles to release if the key's notes are sounding.
    pub fn key_up(&mut self, c: char) -> Option<Vec<Handle>> {
        let key = self.config.get_mapping(c)?.key_char;
        let identity = self.key_to_note.remove(&key)?;
        self.tracker.release(&identity)
    }

    /// Record the handles a play produced. See [`KeyTracker::sounding`].
    pub fn sounding(&mut self, identity: &str, handles: Vec<Handle>) -> bool {
        self.tracker.sounding(identity, handles)
    }

    /// A play ended on its own; the key can start it again.
    pub fn finished(&mut self, identity: &str) {
        self.tracker.finished(identity);
        if !self.tracker.is_held(identity) {
            self.key_to_note.retain(|_, held| held != identity);
        }
    }

    /// Release all held notes, returning the handles to release
    pub fn release_all(&mut self) -> Vec<Handle> {
        self.key_to_note.clear();
        self.tracker.clear()
    }

    /// Shift octave up
    /// Returns the handles that were released before shifting
    pub fn octave_up(&mut self) -> Vec<Handle> {
        let released = self.release_all();
        self.octave_shift = (self.octave_shift + 1).min(MAX_OCTAVE_SHIFT);
        released
    }

    /// Shift octave down
    /// Returns the handles that were released before shifting
    pub fn octave_down(&mut self) -> Vec<Handle> {
        let released = self.release_all();
        self.octave_shift = (self.octave_shift - 1).max(-MAX_OCTAVE_SHIFT);
        released
    }

    /// Names of all held notes, chords flattened, sorted by pitch
    pub fn held_notes(&self) -> Vec<String> {
        let mut notes: Vec<Note> = self
            .tracker
            .identities()
            .into_iter()
            .flat_map(|identity| identity.trim_matches(|c| c == '[' || c == ']').split(' '))
            .filter_map(|name| name.parse().ok())
            .collect();
        notes.sort_by_key(Note::index);
        notes.dedup();
        notes.iter().map(Note::to_string).collect()
    }

    /// Check if a key mapping corresponds to a held note
    pub fn is_key_pressed(&self, mapping: &KeyMapping) -> bool {
        let name = self.note_for_mapping(mapping).to_string();
        self.held_notes().contains(&name)
    }

    pub fn tracker(&self) -> &KeyTracker {
        &self.tracker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(keyboard: &VirtualKeyboard, c: char) -> Option<String> {
        keyboard.get_note_for_char(c).map(|n| n.to_string())
    }

    #[test]
    fn test_us_layout_notes() {
        let keyboard = VirtualKeyboard::new(KeyboardConfig::us_layout());

        assert_eq!(name(&keyboard, 'z').as_deref(), Some("C5"));
        assert_eq!(name(&keyboard, 's').as_deref(), Some("C#5"));
        assert_eq!(name(&keyboard, 'b').as_deref(), Some("G5"));
        // Octave number turns over at A
        assert_eq!(name(&keyboard, 'n').as_deref(), Some("A6"));
        assert_eq!(name(&keyboard, ',').as_deref(), Some("C6"));
        assert_eq!(name(&keyboard, '\\').as_deref(), Some("F6"));
        assert_eq!(name(&keyboard, 'q'), None);
    }

    #[test]
    fn test_german_layout_notes() {
        let keyboard = VirtualKeyboard::new(KeyboardConfig::german_layout());

        assert_eq!(name(&keyboard, 'y').as_deref(), Some("C5"));
        assert_eq!(name(&keyboard, 'ö').as_deref(), Some("D#6"));
        assert_eq!(name(&keyboard, '-').as_deref(), Some("E6"));
        assert_eq!(name(&keyboard, '<').as_deref(), Some("F6"));
        assert_eq!(name(&keyboard, 'z'), None);
    }

    #[test]
    fn test_sorted_mappings_ascend() {
        let config = KeyboardConfig::us_layout();
        let sorted = config.sorted_mappings();
        assert_eq!(sorted.first().map(|m| m.key_char), Some('z'));
        assert_eq!(sorted.last().map(|m| m.key_char), Some('\\'));
        let keyboard = VirtualKeyboard::new(config.clone());
        let indices: Vec<i32> = sorted.iter().map(|m| keyboard.note_for_mapping(m).index()).collect();
        assert!(indices.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_case_insensitive_mapping() {
        let config = KeyboardConfig::german_layout();
        assert_eq!(config.get_mapping('c'), config.get_mapping('C'));
        assert_eq!(config.get_mapping('ö'), config.get_mapping('Ö'));
    }

    #[test]
    fn test_uppercase_plays_chord() {
        let mut keyboard = VirtualKeyboard::default();
        let press = keyboard.key_down('Z').unwrap();
        assert_eq!(press.key, 'z');
        assert_eq!(press.identity, "[C5 E5 G5]");
        assert!(matches!(press.source, Source::Chord(_)));
        assert!(!press.is_finite());
        assert_eq!(keyboard.held_notes(), vec!["C5", "E5", "G5"]);
    }

    #[test]
    fn test_octave_shift() {
        let mut keyboard = VirtualKeyboard::default();
        assert_eq!(name(&keyboard, 'z').as_deref(), Some("C5"));

        keyboard.octave_up();
        assert_eq!(name(&keyboard, 'z').as_deref(), Some("C6"));

        for _ in 0..10 {
            keyboard.octave_down();
        }
        assert_eq!(keyboard.octave_shift, -MAX_OCTAVE_SHIFT);
        assert_eq!(name(&keyboard, 'z').as_deref(), Some("C2"));
    }

    #[test]
    fn test_extreme_base_octave_does_not_overflow() {
        let mut keyboard = VirtualKeyboard::new(KeyboardConfig {
            base_octave: i32::MAX,
            ..KeyboardConfig::default()
        });
        keyboard.octave_up();
        assert_eq!(keyboard.octave(), i32::MAX);

        let press = keyboard.key_down(',').unwrap();
        assert!(matches!(press.source, Source::Note(_)));
        assert_eq!(keyboard.config.sorted_mappings().len(), keyboard.config.mappings.len());
    }

    #[test]
    fn test_octave_shift_releases_held_notes() {
        let mut keyboard = VirtualKeyboard::default();
        let press = keyboard.key_down('z').unwrap();
        assert!(keyboard.sounding(&press.identity, vec![0]));

        assert_eq!(keyboard.octave_up(), vec![0]);
        assert!(keyboard.tracker().is_empty());
        assert_eq!(keyboard.key_up('z'), None);
    }

    #[test]
    fn test_key_down_up() {
        let mut keyboard = VirtualKeyboard::default();

        let press = keyboard.key_down('z').unwrap();
        assert_eq!(press.identity, "C5");
        assert_eq!(keyboard.tracker().state("C5"), Some(&Held::Pending));

        // Pressing again (key repeat) should not trigger
        assert!(keyboard.key_down('z').is_none());
        assert!(keyboard.key_down('Z').is_none());

        assert!(keyboard.sounding("C5", vec![3]));
        assert_eq!(keyboard.key_up('z'), Some(vec![3]));
        assert!(!keyboard.tracker().is_held("C5"));
        assert!(keyboard.key_down('z').is_some());
    }

    #[test]
    fn test_release_before_play_resolves() {
        let mut keyboard = VirtualKeyboard::default();
        let press = keyboard.key_down('x').unwrap();

        assert_eq!(keyboard.key_up('x'), None);
        // Caller has to release these itself
        assert!(!keyboard.sounding(&press.identity, vec![1]));
        assert!(keyboard.tracker().is_empty());
    }

    #[test]
    fn test_finite_notes_finish() {
        let mut config = KeyboardConfig::us_layout();
        config.note_ms = 400;
        let mut keyboard = VirtualKeyboard::new(config);

        let press = keyboard.key_down('c').unwrap();
        assert!(press.is_finite());
        assert!(keyboard.key_down('c').is_none());

        keyboard.finished(&press.identity);
        assert!(keyboard.tracker().is_empty());
        assert!(keyboard.key_down('c').is_some());
    }

    #[test]
    fn test_is_key_pressed() {
        let mut keyboard = VirtualKeyboard::default();
        keyboard.key_down('Z').unwrap();
        let config = keyboard.config.clone();
        let pressed: Vec<char> = config
            .sorted_mappings()
            .into_iter()
            .filter(|m| keyboard.is_key_pressed(m))
            .map(|m| m.key_char)
            .collect();
        assert_eq!(pressed, vec!['z', 'c', 'b']);
    }

    #[test]
    fn test_tracker_dedupe_and_clear() {
        let mut tracker = KeyTracker::new();
        assert!(tracker.press("A5"));
        assert!(!tracker.press("A5"));
        assert!(tracker.press("B5"));
        assert!(tracker.sounding("A5", vec![0, 1]));
        assert!(!tracker.sounding("C5", vec![2]));

        let mut released = tracker.clear();
        released.sort_unstable();
        assert_eq!(released, vec![0, 1]);
        assert!(tracker.is_empty());
    }
}
