//! Command registry for the timing context.
//!
//! Commands are addressed by dotted paths on the wire (`"Note.stop"`) but
//! resolved into the closed [`Command`] enum before anything runs. The
//! [`CommandRegistry`] owns the background-side state: the instrument id
//! arena and the queue of pending note-off timers.
//!
//! The registry never talks to a channel directly. [`CommandRegistry::dispatch`]
//! returns the replies a request produces immediately, and
//! [`CommandRegistry::fire_due`] returns the replies of timers whose deadline
//! passed. The timing thread posts both.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::protocol::{Args, Request, RequestId, Response, StopNotice};
use crate::slots::{Handle, SlotCollection};

/// Every command the timing context understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// Post a [`StopNotice`] for a voice after a delay.
    NoteStop,
    /// Cancel pending `Note.stop` timers for a voice.
    NoteCancel,
    /// Allocate and register an instrument id.
    InstrumentRegister,
    /// Report the next free instrument id without registering it.
    InstrumentGetNextId,
    /// Release an instrument id and drop its timers.
    InstrumentUnregister,
}

impl Command {
    pub const ALL: [Command; 5] = [
        Command::NoteStop,
        Command::NoteCancel,
        Command::InstrumentRegister,
        Command::InstrumentGetNextId,
        Command::InstrumentUnregister,
    ];

    /// Resolve a dotted command path.
    pub fn parse(path: &str) -> Result<Self> {
        if path.is_empty() {
            return Err(Error::MissingArgument { name: "command", index: 1 });
        }
        let mut segments = path.split('.');
        let command = match (segments.next(), segments.next(), segments.next()) {
            (Some("Note"), Some("stop"), None) => Command::NoteStop,
            (Some("Note"), Some("cancel"), None) => Command::NoteCancel,
            (Some("Instrument"), Some("register"), None) => Command::InstrumentRegister,
            (Some("Instrument"), Some("getNextId"), None) => Command::InstrumentGetNextId,
            (Some("Instrument"), Some("unregister"), None) => Command::InstrumentUnregister,
            _ => return Err(Error::UnknownCommand(path.to_string())),
        };
        Ok(command)
    }

    /// The wire path of this command.
    pub fn path(&self) -> &'static str {
        match self {
            Command::NoteStop => "Note.stop",
            Command::NoteCancel => "Note.cancel",
            Command::InstrumentRegister => "Instrument.register",
            Command::InstrumentGetNextId => "Instrument.getNextId",
            Command::InstrumentUnregister => "Instrument.unregister",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Background-side record of a registered instrument.
#[derive(Clone, Debug)]
pub struct InstrumentRecord {
    pub registered_at: Instant,
}

/// Identifies a scheduled timer inside the registry.
pub type TimerId = u64;

/// A pending note-off.
#[derive(Clone, Debug)]
struct Timer {
    deadline: Instant,
    request_id: RequestId,
    instrument_id: Option<Handle>,
    handle: Handle,
    duration_ms: u64,
}

impl Timer {
    fn notice(&self, cancelled: bool) -> Response {
        let notice = StopNotice {
            instrument_id: self.instrument_id,
            handle: self.handle,
            duration: self.duration_ms,
            cancelled,
        };
        Response {
            id: self.request_id,
            command: Command::NoteStop.path().to_string(),
            result: serde_json::to_value(notice).unwrap_or(Value::Null),
        }
    }
}

/// Dispatch table and state of the timing context.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    instruments: SlotCollection<InstrumentRecord>,
    timers: BTreeMap<TimerId, Timer>,
    next_timer_id: TimerId,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve and execute a request.
    ///
    /// Returns the replies to post right away. Unknown paths and bad
    /// arguments fail without producing any reply.
    pub fn dispatch(&mut self, request: &Request, now: Instant) -> Result<Vec<Response>> {
        let command = Command::parse(&request.command)?;
        let args = Args::new(&request.args);

        match command {
            Command::NoteStop => self.note_stop(request.id, &args, now),
            Command::NoteCancel => self.note_cancel(request.id, &args),
            Command::InstrumentRegister => {
                let id = self.instruments.insert(InstrumentRecord { registered_at: now });
                log::debug!("Registered instrument {}", id);
                Ok(vec![reply(request.id, command, json!(id))])
            }
            Command::InstrumentGetNextId => {
                Ok(vec![reply(request.id, command, json!(self.instruments.next_id()))])
            }
            Command::InstrumentUnregister => self.instrument_unregister(request.id, &args, now),
        }
    }

    fn note_stop(&mut self, id: RequestId, args: &Args<'_>, now: Instant) -> Result<Vec<Response>> {
        let (instrument_id, handle, duration_ms) = if args.len() >= 3 {
            (
                Some(args.handle(0, "instrumentId")?),
                args.handle(1, "handle")?,
                args.uint(2, "afterMs")?,
            )
        } else {
            (None, args.handle(0, "handle")?, args.uint(1, "afterMs")?)
        };

        // A newer stop for the same voice supersedes any pending one
        let superseded = self.cancel_where(|t| t.instrument_id == instrument_id && t.handle == handle);

        let timer_id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.insert(
            timer_id,
            Timer {
                deadline: now + Duration::from_millis(duration_ms),
                request_id: id,
                instrument_id,
                handle,
                duration_ms,
            },
        );
        log::debug!(
            "Scheduled note-off timer {} for {:?}/{} in {}ms",
            timer_id,
            instrument_id,
            handle,
            duration_ms
        );

        Ok(superseded)
    }

    fn note_cancel(&mut self, id: RequestId, args: &Args<'_>) -> Result<Vec<Response>> {
        let (instrument_id, handle) = if args.len() >= 2 {
            (Some(args.handle(0, "instrumentId")?), args.handle(1, "handle")?)
        } else {
            (None, args.handle(0, "handle")?)
        };

        let mut replies = self.cancel_where(|t| t.instrument_id == instrument_id && t.handle == handle);
        let count = replies.len();
        replies.push(reply(id, Command::NoteCancel, json!(count)));
        Ok(replies)
    }

    fn instrument_unregister(&mut self, id: RequestId, args: &Args<'_>, now: Instant) -> Result<Vec<Response>> {
        let instrument_id = args.handle(0, "instrumentId")?;
        let mut replies = self.cancel_where(|t| t.instrument_id == Some(instrument_id));

        let released = self.instruments.release(instrument_id);
        if let Some(record) = &released {
            log::debug!(
                "Unregistered instrument {} after {:?}",
                instrument_id,
                now.saturating_duration_since(record.registered_at)
            );
        }
        replies.push(reply(id, Command::InstrumentUnregister, json!(released.is_some())));
        Ok(replies)
    }

    /// Cancel matching timers, returning a cancelled notice for each.
    fn cancel_where<F>(&mut self, pred: F) -> Vec<Response>
    where
        F: Fn(&Timer) -> bool,
    {
        let ids: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(_, t)| pred(*t))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| self.timers.remove(&id))
            .map(|timer| {
                log::debug!("Cancelled note-off for {:?}/{}", timer.instrument_id, timer.handle);
                timer.notice(true)
            })
            .collect()
    }

    /// Remove every timer due at `now` and return their notices in deadline order.
    pub fn fire_due(&mut self, now: Instant) -> Vec<Response> {
        let mut due: Vec<(TimerId, Instant)> = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .map(|(id, t)| (*id, t.deadline))
            .collect();
        // Timer ids break ties so equal deadlines fire in scheduling order
        due.sort_by_key(|&(id, deadline)| (deadline, id));

        due.into_iter()
            .filter_map(|(id, _)| self.timers.remove(&id))
            .map(|timer| timer.notice(false))
            .collect()
    }

    /// Earliest pending timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.deadline).min()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    pub fn instruments(&self) -> &SlotCollection<InstrumentRecord> {
        &self.instruments
    }
}

fn reply(id: RequestId, command: Command, result: Value) -> Response {
    Response {
        id,
        command: command.path().to_string(),
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: RequestId, command: &str, args: Vec<Value>) -> Request {
        Request {
            id,
            command: command.to_string(),
            args,
        }
    }

    #[test]
    fn test_parse_paths() {
        for command in Command::ALL {
            assert_eq!(Command::parse(command.path()).unwrap(), command);
        }
        assert!(matches!(Command::parse("Note.play"), Err(Error::UnknownCommand(_))));
        assert!(matches!(Command::parse("Note.stop.now"), Err(Error::UnknownCommand(_))));
        assert!(matches!(Command::parse("Note"), Err(Error::UnknownCommand(_))));
        assert!(matches!(Command::parse(""), Err(Error::MissingArgument { name: "command", .. })));
    }

    #[test]
    fn test_unknown_command_produces_no_reply() {
        let mut registry = CommandRegistry::new();
        let result = registry.dispatch(&request(1, "Synth.play", vec![]), Instant::now());
        assert!(matches!(result, Err(Error::UnknownCommand(path)) if path == "Synth.play"));
        assert_eq!(registry.pending_timers(), 0);
    }

    #[test]
    fn test_register_reuses_lowest_id() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();

        let a = registry.dispatch(&request(1, "Instrument.register", vec![]), now).unwrap();
        let b = registry.dispatch(&request(2, "Instrument.register", vec![]), now).unwrap();
        assert_eq!(a[0].result, json!(0));
        assert_eq!(b[0].result, json!(1));

        let next = registry.dispatch(&request(3, "Instrument.getNextId", vec![]), now).unwrap();
        assert_eq!(next[0].result, json!(2));

        let gone = registry.dispatch(&request(4, "Instrument.unregister", vec![json!(0)]), now).unwrap();
        assert_eq!(gone.last().unwrap().result, json!(true));

        let c = registry.dispatch(&request(5, "Instrument.register", vec![]), now).unwrap();
        assert_eq!(c[0].result, json!(0));
        assert_eq!(c[0].id, 5);
        assert_eq!(c[0].command, "Instrument.register");
    }

    #[test]
    fn test_note_stop_fires_after_delay() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();

        let immediate = registry
            .dispatch(&request(7, "Note.stop", vec![json!(5), json!(100)]), now)
            .unwrap();
        assert!(immediate.is_empty());
        assert_eq!(registry.next_deadline(), Some(now + Duration::from_millis(100)));

        assert!(registry.fire_due(now + Duration::from_millis(99)).is_empty());

        let fired = registry.fire_due(now + Duration::from_millis(100));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, 7);
        assert_eq!(fired[0].command, "Note.stop");
        assert_eq!(fired[0].result, json!({"handle": 5, "duration": 100}));
        assert_eq!(registry.pending_timers(), 0);
    }

    #[test]
    fn test_note_stop_with_instrument() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();
        registry
            .dispatch(&request(1, "Note.stop", vec![json!(2), json!(3), json!(0)]), now)
            .unwrap();

        let fired = registry.fire_due(now);
        assert_eq!(fired[0].result, json!({"instrumentId": 2, "handle": 3, "duration": 0}));
    }

    #[test]
    fn test_newer_stop_supersedes_pending() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();
        registry
            .dispatch(&request(1, "Note.stop", vec![json!(0), json!(4), json!(500)]), now)
            .unwrap();

        // Manual release for the same voice
        let superseded = registry
            .dispatch(&request(2, "Note.stop", vec![json!(0), json!(4), json!(0)]), now)
            .unwrap();
        assert_eq!(superseded.len(), 1);
        assert_eq!(superseded[0].id, 1);
        let notice: StopNotice = superseded[0].decode().unwrap();
        assert!(notice.cancelled);
        assert_eq!(notice.duration, 500);

        let fired = registry.fire_due(now + Duration::from_secs(1));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, 2);
    }

    #[test]
    fn test_stops_for_other_voices_are_untouched() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();
        registry
            .dispatch(&request(1, "Note.stop", vec![json!(0), json!(4), json!(50)]), now)
            .unwrap();
        let superseded = registry
            .dispatch(&request(2, "Note.stop", vec![json!(1), json!(4), json!(50)]), now)
            .unwrap();
        assert!(superseded.is_empty());
        assert_eq!(registry.pending_timers(), 2);
    }

    #[test]
    fn test_note_cancel() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();
        registry
            .dispatch(&request(1, "Note.stop", vec![json!(6), json!(1000)]), now)
            .unwrap();

        let replies = registry.dispatch(&request(2, "Note.cancel", vec![json!(6)]), now).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, 1);
        assert_eq!(replies[1].id, 2);
        assert_eq!(replies[1].result, json!(1));
        assert!(registry.fire_due(now + Duration::from_secs(2)).is_empty());
    }

    #[test]
    fn test_unregister_cancels_instrument_timers() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();
        registry.dispatch(&request(1, "Instrument.register", vec![]), now).unwrap();
        registry
            .dispatch(&request(2, "Note.stop", vec![json!(0), json!(0), json!(300)]), now)
            .unwrap();

        let replies = registry
            .dispatch(&request(3, "Instrument.unregister", vec![json!(0)]), now)
            .unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].id, 2);
        assert_eq!(registry.pending_timers(), 0);

        let again = registry
            .dispatch(&request(4, "Instrument.unregister", vec![json!(0)]), now)
            .unwrap();
        assert_eq!(again[0].result, json!(false));
    }

    #[test]
    fn test_fire_due_orders_by_deadline() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();
        registry.dispatch(&request(1, "Note.stop", vec![json!(1), json!(30)]), now).unwrap();
        registry.dispatch(&request(2, "Note.stop", vec![json!(2), json!(10)]), now).unwrap();
        registry.dispatch(&request(3, "Note.stop", vec![json!(3), json!(20)]), now).unwrap();

        let ids: Vec<_> = registry
            .fire_due(now + Duration::from_millis(30))
            .iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_bad_arguments() {
        let mut registry = CommandRegistry::new();
        let now = Instant::now();

        let missing = registry.dispatch(&request(1, "Note.stop", vec![json!(1)]), now);
        assert!(matches!(missing, Err(Error::MissingArgument { name: "afterMs", index: 2 })));

        let wrong = registry.dispatch(&request(2, "Note.stop", vec![json!("x"), json!(1)]), now);
        assert!(matches!(wrong, Err(Error::NotAcceptable { name: "handle", index: 1, .. })));
        assert_eq!(registry.pending_timers(), 0);
    }
}
