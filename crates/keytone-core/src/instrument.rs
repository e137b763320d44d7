//! Play/stop orchestration.
//!
//! An [`Instrument`] owns the voices it is currently sounding, keyed by
//! handles from a [`SlotCollection`]. Starting a voice and allocating its
//! handle happen under one lock with no suspension in between, so concurrent
//! plays on the same instrument never race for a handle.
//!
//! Every note termination goes through the timing context: a finite note
//! asks for a `Note.stop` after its duration, and [`Instrument::release`]
//! asks for one after zero milliseconds, which also cancels the pending
//! natural expiry. Each sounding voice carries a serial; a deferred stop only
//! clears the slot if it still holds the voice it was scheduled for.

use futures::future::try_join_all;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::channel::CommandChannel;
use crate::error::Result;
use crate::note::{Chord, Note, PitchClass, Source};
use crate::protocol::StopNotice;
use crate::registry::Command;
use crate::slots::{Handle, SlotCollection};
use crate::voice::{Voice, VoiceBackend};

/// Handles returned by [`Instrument::play`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Played {
    Note(Handle),
    Chord(Vec<Handle>),
}

impl Played {
    pub fn handles(&self) -> Vec<Handle> {
        match self {
            Played::Note(handle) => vec![*handle],
            Played::Chord(handles) => handles.clone(),
        }
    }
}

struct Sounding {
    serial: u64,
    note: Note,
    voice: Box<dyn Voice>,
}

/// An instrument registered with a timing context.
pub struct Instrument {
    id: Handle,
    channel: Arc<CommandChannel>,
    backend: Arc<dyn VoiceBackend>,
    voices: Mutex<SlotCollection<Sounding>>,
    next_serial: AtomicU64,
}

impl Instrument {
    /// Register a new instrument and wait for its id.
    pub async fn register(channel: Arc<CommandChannel>, backend: Arc<dyn VoiceBackend>) -> Result<Self> {
        let reply = channel.request(Command::InstrumentRegister.path(), vec![])?.await?;
        let id: Handle = serde_json::from_value(reply)?;
        log::info!("Instrument {} registered ({} backend)", id, backend.name());

        Ok(Self {
            id,
            channel,
            backend,
            voices: Mutex::new(SlotCollection::new()),
            next_serial: AtomicU64::new(0),
        })
    }

    /// Id assigned by the timing context.
    pub fn id(&self) -> Handle {
        self.id
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Create a note for this instrument; a negative `duration_ms` means indefinite.
    pub fn create_note(&self, pitch: PitchClass, octave: i32, duration_ms: i64) -> Note {
        Note::new(pitch, octave, duration_ms)
    }

    /// Play a note or chord.
    ///
    /// Resolves once every finite note has been stopped by the timing
    /// context; indefinite notes resolve right away and keep sounding until
    /// [`stop`](Self::stop) or [`release`](Self::release).
    pub async fn play(&self, source: impl Into<Source>) -> Result<Played> {
        match source.into() {
            Source::Note(note) => self.play_note(note).await,
            Source::Chord(chord) => self.play_chord(chord).await,
        }
    }

    async fn play_note(&self, note: Note) -> Result<Played> {
        let (handle, serial) = self.start_voice(&note)?;

        if let Some(ms) = note.duration_ms() {
            if let Err(e) = self.await_stop(handle, serial, ms).await {
                self.silence(handle, serial);
                return Err(e);
            }
        }
        Ok(Played::Note(handle))
    }

    async fn play_chord(&self, chord: Chord) -> Result<Played> {
        let mut started: Vec<(Handle, u64, Option<u64>)> = Vec::with_capacity(chord.notes.len());
        for note in &chord.notes {
            match self.start_voice(note) {
                Ok((handle, serial)) => started.push((handle, serial, note.duration_ms())),
                Err(e) => {
                    log::warn!("Chord {} failed at {}: {}", chord, note, e);
                    for &(handle, serial, _) in &started {
                        self.silence(handle, serial);
                    }
                    return Err(e);
                }
            }
        }

        let waits = started
            .iter()
            .filter_map(|&(handle, serial, ms)| ms.map(|ms| self.await_stop(handle, serial, ms)));
        if let Err(e) = try_join_all(waits).await {
            log::warn!("Chord {} aborted: {}", chord, e);
            for &(handle, serial, _) in &started {
                self.silence(handle, serial);
            }
            return Err(e);
        }

        Ok(Played::Chord(started.iter().map(|&(handle, _, _)| handle).collect()))
    }

    /// Start a voice and store it under a fresh handle.
    fn start_voice(&self, note: &Note) -> Result<(Handle, u64)> {
        let voice = self.backend.start(note)?;
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let handle = self.voices().insert(Sounding {
            serial,
            note: *note,
            voice,
        });
        log::debug!("Instrument {} playing {} as {}", self.id, note, handle);
        Ok((handle, serial))
    }

    /// Wait for the timing context to report the end of a finite note.
    async fn await_stop(&self, handle: Handle, serial: u64, duration_ms: u64) -> Result<()> {
        let notice = self.request_stop(handle, duration_ms)?.await?;
        if notice.cancelled {
            log::debug!("Deferred stop of {} cancelled", handle);
        } else {
            self.clear(handle, serial);
        }
        Ok(())
    }

    /// Ask the timing context for a `Note.stop` notice for `handle`.
    fn request_stop(
        &self,
        handle: Handle,
        after_ms: u64,
    ) -> Result<impl std::future::Future<Output = Result<StopNotice>>> {
        let instrument_id = self.id;
        let reply = self.channel.request_matching(
            Command::NoteStop.path(),
            vec![json!(instrument_id), json!(handle), json!(after_ms)],
            move |result| {
                serde_json::from_value::<StopNotice>(result.clone()).is_ok_and(|n| {
                    n.instrument_id == Some(instrument_id) && n.handle == handle && n.duration == after_ms
                })
            },
        )?;
        Ok(async move { Ok(serde_json::from_value(reply.await?)?) })
    }

    /// Stop the voice at `handle` immediately.
    ///
    /// Returns `false`, changing nothing, when the slot is already empty.
    /// A pending deferred stop for the handle is cancelled.
    pub fn stop(&self, handle: Handle) -> bool {
        let taken = self.voices().release(handle);
        match taken {
            Some(mut sounding) => {
                sounding.voice.stop();
                log::debug!("Instrument {} stopped {} ({})", self.id, handle, sounding.note);
                self.cancel_pending(handle);
                true
            }
            None => {
                log::debug!("Instrument {}: handle {} is not sounding", self.id, handle);
                false
            }
        }
    }

    /// Stop `handle` through the timing context, like a key release.
    ///
    /// Supersedes any pending natural expiry for the voice. Returns
    /// `Ok(false)` without sending anything if the handle is not sounding.
    pub async fn release(&self, handle: Handle) -> Result<bool> {
        let serial = match self.voices().get(handle) {
            Some(sounding) => sounding.serial,
            None => return Ok(false),
        };

        let notice = self.request_stop(handle, 0)?.await?;
        if notice.cancelled {
            // A later stop request for the same voice took over
            return Ok(false);
        }
        Ok(self.clear(handle, serial))
    }

    /// Stop every sounding voice, returning how many were stopped.
    pub fn stop_all(&self) -> usize {
        let drained = self.voices().drain();
        let count = drained.len();
        for (handle, mut sounding) in drained {
            sounding.voice.stop();
            self.cancel_pending(handle);
        }
        if count > 0 {
            log::debug!("Instrument {} stopped all {} voices", self.id, count);
        }
        count
    }

    /// Stop all voices and give the id back to the timing context.
    pub async fn unregister(self) -> Result<bool> {
        self.stop_all();
        let reply = self
            .channel
            .request(Command::InstrumentUnregister.path(), vec![json!(self.id)])?
            .await?;
        log::info!("Instrument {} unregistered", self.id);
        Ok(serde_json::from_value(reply)?)
    }

    pub fn is_sounding(&self, handle: Handle) -> bool {
        self.voices().is_occupied(handle)
    }

    /// Currently sounding notes with their handles.
    pub fn sounding(&self) -> Vec<(Handle, Note)> {
        self.voices().iter().map(|(handle, s)| (handle, s.note)).collect()
    }

    /// Clear the slot if it still holds the voice with `serial`.
    fn clear(&self, handle: Handle, serial: u64) -> bool {
        let taken = self.voices().release_if(handle, |s| s.serial == serial);
        match taken {
            Some(mut sounding) => {
                sounding.voice.stop();
                log::debug!("Instrument {} stopped {} ({})", self.id, handle, sounding.note);
                true
            }
            None => false,
        }
    }

    /// Clear a voice and drop whatever the timing context still holds for it.
    fn silence(&self, handle: Handle, serial: u64) {
        if self.clear(handle, serial) {
            self.cancel_pending(handle);
        }
    }

    fn cancel_pending(&self, handle: Handle) {
        let args = vec![json!(self.id), json!(handle)];
        if let Err(e) = self.channel.send_command(Command::NoteCancel.path(), args) {
            log::warn!("Could not cancel deferred stop of {}: {}", handle, e);
        }
    }

    fn voices(&self) -> MutexGuard<'_, SlotCollection<Sounding>> {
        self.voices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("sounding", &self.voices().occupied())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::note::ChordKind;
    use crate::timing::TimingConfig;
    use std::time::{Duration, Instant};

    /// Backend that records voice on/off events.
    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
        fail_on: Option<String>,
    }

    struct RecordedVoice {
        label: String,
        events: Arc<Mutex<Vec<String>>>,
    }

    impl Voice for RecordedVoice {
        fn stop(&mut self) {
            self.events.lock().unwrap().push(format!("off {}", self.label));
        }
    }

    impl VoiceBackend for Recorder {
        fn start(&self, note: &Note) -> Result<Box<dyn Voice>> {
            let label = note.to_string();
            if self.fail_on.as_deref() == Some(label.as_str()) {
                return Err(Error::Voice(format!("cannot start {}", label)));
            }
            self.events.lock().unwrap().push(format!("on {}", label));
            Ok(Box::new(RecordedVoice {
                label,
                events: self.events.clone(),
            }))
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    impl Recorder {
        fn stops(&self) -> usize {
            self.events.lock().unwrap().iter().filter(|e| e.starts_with("off")).count()
        }
    }

    fn channel() -> Arc<CommandChannel> {
        let _ = env_logger::builder().is_test(true).try_init();
        Arc::new(CommandChannel::spawn(TimingConfig::default()))
    }

    async fn instrument(channel: &Arc<CommandChannel>, recorder: &Recorder) -> Arc<Instrument> {
        Arc::new(
            Instrument::register(channel.clone(), Arc::new(recorder.clone()))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_instrument_ids_are_reused() {
        let channel = channel();
        let recorder = Recorder::default();

        let a = Instrument::register(channel.clone(), Arc::new(recorder.clone())).await.unwrap();
        let b = Instrument::register(channel.clone(), Arc::new(recorder.clone())).await.unwrap();
        assert_eq!((a.id(), b.id()), (0, 1));

        assert!(a.unregister().await.unwrap());
        let c = Instrument::register(channel.clone(), Arc::new(recorder.clone())).await.unwrap();
        assert_eq!(c.id(), 0);
    }

    #[tokio::test]
    async fn test_indefinite_note_and_idempotent_stop() {
        let channel = channel();
        let recorder = Recorder::default();
        let piano = instrument(&channel, &recorder).await;

        let first = piano.play(piano.create_note(PitchClass::C, 5, -1)).await.unwrap();
        let second = piano.play(piano.create_note(PitchClass::E, 5, -1)).await.unwrap();
        assert_eq!((first, second.clone()), (Played::Note(0), Played::Note(1)));
        assert!(piano.is_sounding(0) && piano.is_sounding(1));

        assert!(piano.stop(0));
        assert!(!piano.stop(0));
        assert_eq!(recorder.stops(), 1);
        assert!(piano.is_sounding(1));

        // The freed handle is reused first
        let third = piano.play(piano.create_note(PitchClass::G, 5, -1)).await.unwrap();
        assert_eq!(third, Played::Note(0));
    }

    #[tokio::test]
    async fn test_deferred_stop_waits_for_duration() {
        let channel = channel();
        let recorder = Recorder::default();
        let piano = instrument(&channel, &recorder).await;

        let started = Instant::now();
        let player = piano.clone();
        let task = tokio::spawn(async move { player.play(Note::new(PitchClass::A, 5, 100)).await });

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(recorder.stops(), 0);
        assert!(piano.is_sounding(0));

        assert_eq!(task.await.unwrap().unwrap(), Played::Note(0));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(recorder.stops(), 1);
        assert!(!piano.is_sounding(0));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_chord_resolves_after_all_notes() {
        let channel = channel();
        let recorder = Recorder::default();
        let piano = instrument(&channel, &recorder).await;

        let started = Instant::now();
        let chord = Chord::new(Note::new(PitchClass::C, 5, 60), ChordKind::Major);
        let played = piano.play(chord).await.unwrap();

        assert_eq!(played, Played::Chord(vec![0, 1, 2]));
        assert!(started.elapsed() >= Duration::from_millis(60));
        assert_eq!(recorder.stops(), 3);
        assert!(piano.sounding().is_empty());
    }

    #[tokio::test]
    async fn test_indefinite_chord_keeps_sounding() {
        let channel = channel();
        let recorder = Recorder::default();
        let piano = instrument(&channel, &recorder).await;

        let played = piano
            .play(Chord::new(Note::new(PitchClass::A, 4, -1), ChordKind::Minor))
            .await
            .unwrap();
        assert_eq!(played.handles(), vec![0, 1, 2]);

        let names: Vec<String> = piano.sounding().iter().map(|(_, n)| n.to_string()).collect();
        assert_eq!(names, vec!["A4", "C4", "E4"]);
        assert_eq!(piano.stop_all(), 3);
        assert_eq!(recorder.stops(), 3);
    }

    #[tokio::test]
    async fn test_release_cancels_natural_expiry() {
        let channel = channel();
        let recorder = Recorder::default();
        let piano = instrument(&channel, &recorder).await;

        let started = Instant::now();
        let player = piano.clone();
        let task = tokio::spawn(async move { player.play(Note::new(PitchClass::D, 5, 500)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(piano.release(0).await.unwrap());
        assert_eq!(task.await.unwrap().unwrap(), Played::Note(0));
        assert!(started.elapsed() < Duration::from_millis(400));

        // Nothing fires later
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.stops(), 1);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_release_of_silent_handle() {
        let channel = channel();
        let piano = instrument(&channel, &Recorder::default()).await;
        assert!(!piano.release(3).await.unwrap());
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_stop_spares_reused_handle() {
        let channel = channel();
        let recorder = Recorder::default();
        let piano = instrument(&channel, &recorder).await;

        let player = piano.clone();
        let task = tokio::spawn(async move { player.play(Note::new(PitchClass::C, 5, 80)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Stop directly, then reuse the handle for a held note
        assert!(piano.stop(0));
        assert_eq!(piano.play(Note::new(PitchClass::F, 5, -1)).await.unwrap(), Played::Note(0));

        task.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(piano.is_sounding(0));
        assert_eq!(recorder.stops(), 1);
    }

    #[tokio::test]
    async fn test_chord_rolls_back_on_failure() {
        let channel = channel();
        let recorder = Recorder {
            fail_on: Some("G5".to_string()),
            ..Recorder::default()
        };
        let piano = instrument(&channel, &recorder).await;

        let result = piano
            .play(Chord::new(Note::new(PitchClass::C, 5, -1), ChordKind::Major))
            .await;
        assert!(matches!(result, Err(Error::Voice(_))));
        assert!(piano.sounding().is_empty());
        assert_eq!(recorder.stops(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_plays_get_distinct_handles() {
        let channel = channel();
        let recorder = Recorder::default();
        let piano = instrument(&channel, &recorder).await;

        let plays = (0..8).map(|i| {
            let player = piano.clone();
            tokio::spawn(async move { player.play(Note::from_index(40 + i, None)).await })
        });
        let mut handles: Vec<Handle> = Vec::new();
        for task in plays.collect::<Vec<_>>() {
            handles.extend(task.await.unwrap().unwrap().handles());
        }
        handles.sort_unstable();
        assert_eq!(handles, (0..8).collect::<Vec<_>>());
    }
}
