//! Background timing context.
//!
//! The timing thread is the only place note-off timers live. It:
//! - Owns the [`CommandRegistry`] (instrument ids and pending timers)
//! - Receives [`Request`]s from the foreground
//! - Posts [`Response`]s back, either immediately or when a timer fires
//!
//! Nothing is shared with the foreground; both directions are crossbeam
//! channels carrying owned messages.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::protocol::{Request, Response};
use crate::registry::CommandRegistry;

/// Default upper bound on how long the thread sleeps between shutdown checks.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Timing thread settings.
#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Longest idle wait before the shutdown flag is checked again.
    pub poll_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
        }
    }
}

/// Handle to the running timing thread.
///
/// Dropping it signals shutdown and joins the thread.
pub struct TimingContext {
    shutdown: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl TimingContext {
    /// Start the timing thread.
    ///
    /// Returns the context handle, the sender for requests and the receiver
    /// for replies.
    pub fn start(config: TimingConfig) -> (Self, Sender<Request>, Receiver<Response>) {
        let (request_tx, request_rx) = unbounded();
        let (response_tx, response_rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread_shutdown = shutdown.clone();
        let thread_handle = thread::spawn(move || {
            let mut ctx = TimingThread {
                registry: CommandRegistry::new(),
                request_rx,
                response_tx,
                poll_interval: config.poll_interval,
            };
            ctx.run(thread_shutdown);
        });
        log::info!("Timing context started");

        let context = Self {
            shutdown,
            thread_handle: Some(thread_handle),
        };
        (context, request_tx, response_rx)
    }

    /// Signal the thread to stop and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TimingContext {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TimingThread {
    registry: CommandRegistry,
    request_rx: Receiver<Request>,
    response_tx: Sender<Response>,
    poll_interval: Duration,
}

impl TimingThread {
    fn run(&mut self, shutdown: Arc<AtomicBool>) {
        while !shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            let fired = self.registry.fire_due(now);
            self.post(fired);

            let wait = self
                .registry
                .next_deadline()
                .map(|deadline| deadline.saturating_duration_since(now))
                .unwrap_or(self.poll_interval)
                .min(self.poll_interval);

            match self.request_rx.recv_timeout(wait) {
                Ok(request) => self.handle_request(request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if self.registry.pending_timers() > 0 {
            log::debug!("Timing context exiting with {} pending timers", self.registry.pending_timers());
        }
        log::info!("Timing context stopped");
    }

    fn handle_request(&mut self, request: Request) {
        log::debug!("<- {} #{} {:?}", request.command, request.id, request.args);
        match self.registry.dispatch(&request, Instant::now()) {
            Ok(replies) => self.post(replies),
            // The request is dropped; its caller never sees a reply
            Err(e) => log::warn!("Dropped request #{} ({}): {}", request.id, request.command, e),
        }
    }

    fn post(&self, replies: Vec<Response>) {
        for reply in replies {
            log::debug!("-> {} #{} {}", reply.command, reply.id, reply.result);
            if self.response_tx.send(reply).is_err() {
                log::debug!("Reply receiver gone, discarding reply");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(id: u64, command: &str, args: Vec<serde_json::Value>) -> Request {
        Request {
            id,
            command: command.to_string(),
            args,
        }
    }

    #[test]
    fn test_note_stop_round_trip() {
        let (_ctx, tx, rx) = TimingContext::start(TimingConfig::default());
        tx.send(request(1, "Note.stop", vec![json!(5), json!(0)])).unwrap();

        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.id, 1);
        assert_eq!(reply.command, "Note.stop");
        assert_eq!(reply.result, json!({"handle": 5, "duration": 0}));
    }

    #[test]
    fn test_register_replies_immediately() {
        let (_ctx, tx, rx) = TimingContext::start(TimingConfig::default());
        tx.send(request(1, "Instrument.register", vec![])).unwrap();
        tx.send(request(2, "Instrument.register", vec![])).unwrap();

        let first = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!((first.id, first.result), (1, json!(0)));
        assert_eq!((second.id, second.result), (2, json!(1)));
    }

    #[test]
    fn test_unknown_command_does_not_stop_the_thread() {
        let (ctx, tx, rx) = TimingContext::start(TimingConfig::default());
        tx.send(request(1, "Note.explode", vec![])).unwrap();
        tx.send(request(2, "Note.stop", vec![json!("bad"), json!(0)])).unwrap();
        tx.send(request(3, "Instrument.getNextId", vec![])).unwrap();

        // Only the valid request is answered
        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(reply.id, 3);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert!(ctx.is_running());
    }

    #[test]
    fn test_timer_waits_for_deadline() {
        let (_ctx, tx, rx) = TimingContext::start(TimingConfig::default());
        let sent = Instant::now();
        tx.send(request(1, "Note.stop", vec![json!(0), json!(80)])).unwrap();

        let reply = rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert!(sent.elapsed() >= Duration::from_millis(80));
        assert_eq!(reply.result, json!({"handle": 0, "duration": 80}));
    }

    #[test]
    fn test_shutdown_closes_reply_stream() {
        let (ctx, _tx, rx) = TimingContext::start(TimingConfig::default());
        ctx.shutdown();
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(1)),
            Err(RecvTimeoutError::Disconnected)
        ));
    }
}
