//! Foreground side of the command protocol.
//!
//! [`CommandChannel::request_command`] sends one [`Request`] and returns a
//! [`PendingReply`] future. A reply router thread drains the response
//! stream and forwards each reply to the pending call with the same
//! correlation id and command. The optional predicate only validates the
//! payload, and it runs on the waiting task, never on the router.

use crossbeam_channel::{Receiver, Sender};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::{Request, RequestId, Response};
use crate::timing::{TimingConfig, TimingContext};

/// Payload check applied to a reply before it resolves a call.
pub type Predicate = Box<dyn Fn(&Value) -> bool + Send + Sync>;

struct PendingCall {
    command: String,
    replies: mpsc::UnboundedSender<Value>,
}

type PendingTable = Arc<Mutex<HashMap<RequestId, PendingCall>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<RequestId, PendingCall>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Request/response channel to a timing context.
pub struct CommandChannel {
    request_tx: Sender<Request>,
    pending: PendingTable,
    next_id: AtomicU64,
    router: Option<JoinHandle<()>>,
    context: Option<TimingContext>,
}

impl CommandChannel {
    /// Start a timing context and connect to it.
    ///
    /// The context is shut down when the channel is dropped.
    pub fn spawn(config: TimingConfig) -> Self {
        let (context, request_tx, response_rx) = TimingContext::start(config);
        let mut channel = Self::new(request_tx, response_rx);
        channel.context = Some(context);
        channel
    }

    /// Connect to an already running context through its endpoints.
    pub fn new(request_tx: Sender<Request>, response_rx: Receiver<Response>) -> Self {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let router_pending = pending.clone();
        let router = thread::spawn(move || route_replies(response_rx, router_pending));

        Self {
            request_tx,
            pending,
            next_id: AtomicU64::new(1),
            router: Some(router),
            context: None,
        }
    }

    /// Send `command` and wait for its reply.
    pub fn request(&self, command: &str, args: Vec<Value>) -> Result<PendingReply> {
        self.request_command(command, args, None)
    }

    /// Send `command` and wait for a reply whose result satisfies `predicate`.
    pub fn request_matching<P>(&self, command: &str, args: Vec<Value>, predicate: P) -> Result<PendingReply>
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.request_command(command, args, Some(Box::new(predicate)))
    }

    /// Send a request and register a pending call for its reply.
    ///
    /// Exactly one message is sent per call. Fails synchronously, before
    /// sending, when `command` is empty.
    pub fn request_command(
        &self,
        command: &str,
        args: Vec<Value>,
        predicate: Option<Predicate>,
    ) -> Result<PendingReply> {
        if command.is_empty() {
            return Err(Error::MissingArgument { name: "command", index: 1 });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (replies, rx) = mpsc::unbounded_channel();

        // Register before sending so an immediate reply cannot be missed
        lock(&self.pending).insert(
            id,
            PendingCall {
                command: command.to_string(),
                replies,
            },
        );

        let request = Request {
            id,
            command: command.to_string(),
            args,
        };
        if self.request_tx.send(request).is_err() {
            lock(&self.pending).remove(&id);
            return Err(Error::ChannelClosed);
        }

        Ok(PendingReply {
            id,
            rx,
            predicate,
            pending: self.pending.clone(),
            done: false,
        })
    }

    /// Like [`request_command`](Self::request_command), giving up after `timeout`.
    pub async fn request_command_timeout(
        &self,
        command: &str,
        args: Vec<Value>,
        predicate: Option<Predicate>,
        timeout: Duration,
    ) -> Result<Value> {
        let reply = self.request_command(command, args, predicate)?;
        tokio::time::timeout(timeout, reply)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }

    /// Send a request without waiting for (or routing) its reply.
    pub fn send_command(&self, command: &str, args: Vec<Value>) -> Result<()> {
        if command.is_empty() {
            return Err(Error::MissingArgument { name: "command", index: 1 });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.request_tx
            .send(Request {
                id,
                command: command.to_string(),
                args,
            })
            .map_err(|_| Error::ChannelClosed)
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        if let Some(context) = self.context.take() {
            context.shutdown();
            // The router exits once the context drops its reply sender
            if let Some(router) = self.router.take() {
                let _ = router.join();
            }
        }
    }
}

impl std::fmt::Debug for CommandChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

fn route_replies(response_rx: Receiver<Response>, pending: PendingTable) {
    for response in response_rx.iter() {
        let mut table = lock(&pending);

        let call = match table.get(&response.id) {
            Some(call) => call,
            None => {
                log::debug!("Unclaimed reply #{} ({})", response.id, response.command);
                continue;
            }
        };
        if call.command != response.command {
            log::warn!(
                "Reply #{} is for {}, expected {}",
                response.id,
                response.command,
                call.command
            );
            continue;
        }

        if call.replies.send(response.result).is_err() {
            // The caller stopped waiting
            table.remove(&response.id);
        }
    }

    let abandoned = lock(&pending).drain().count();
    if abandoned > 0 {
        log::warn!("Reply stream closed with {} pending calls", abandoned);
    }
}

/// Future resolving to the result of one request.
///
/// Dropping it before it resolves deregisters the pending call.
///
/// Replies carrying its id are checked against the predicate as they
/// arrive; rejected ones are logged and skipped. A panicking predicate
/// unwinds the waiting task only.
pub struct PendingReply {
    id: RequestId,
    rx: mpsc::UnboundedReceiver<Value>,
    predicate: Option<Predicate>,
    pending: PendingTable,
    done: bool,
}

impl PendingReply {
    pub fn id(&self) -> RequestId {
        self.id
    }

    fn finish(&mut self) {
        self.done = true;
        lock(&self.pending).remove(&self.id);
    }
}

impl Future for PendingReply {
    type Output = Result<Value>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(value)) => {
                    if this.predicate.as_ref().map_or(true, |p| p(&value)) {
                        this.finish();
                        return Poll::Ready(Ok(value));
                    }
                    log::warn!("Reply #{} rejected: {}", this.id, value);
                }
                Poll::Ready(None) => {
                    this.finish();
                    return Poll::Ready(Err(Error::ChannelClosed));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.done {
            lock(&self.pending).remove(&self.id);
        }
    }
}
