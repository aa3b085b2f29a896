//! Correlation of asynchronous device replies with the callers awaiting them
//!
//! A caller registers a waiter for a message id before sending the command.
//! Replies arrive either through the shared reply topic (from whichever node
//! owns the device) or directly from the local device layer. A reply may be
//! split into fragments sharing a parent id; the waiter completes once the
//! declared number of fragments has been pushed or a fragment is flagged
//! last, whichever comes first.
//!
//! Buffering: each waiter holds a bounded channel. When it is full the
//! producer is refused, the waiter is evicted and the caller's stream ends
//! with [`Error::ReplyBufferFull`] after draining what was already buffered.
//!
//! Deadlines are enforced on the waiter itself, not only by the caller's
//! stream: a reply arriving after the deadline is refused even if the
//! stream was never polled.

use futures::Stream;
use parking_lot::RwLock;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

use super::correlation::{CorrelationTable, Retain};
use crate::error::{Error, Result};
use crate::message::DeviceMessageReply;

/// Receives failures hit while processing one inbound reply
///
/// The shared reply subscription keeps running whatever the handler does.
pub trait ReplyFailureHandler: Send + Sync {
    fn handle(&self, error: &Error, reply: Option<&DeviceMessageReply>);
}

impl<F> ReplyFailureHandler for F
where
    F: Fn(&Error, Option<&DeviceMessageReply>) + Send + Sync,
{
    fn handle(&self, error: &Error, reply: Option<&DeviceMessageReply>) {
        self(error, reply);
    }
}

/// Default handler: log and carry on
#[derive(Debug, Default, Clone, Copy)]
pub struct LogReplyFailure;

impl ReplyFailureHandler for LogReplyFailure {
    fn handle(&self, error: &Error, reply: Option<&DeviceMessageReply>) {
        warn!(
            error = %error,
            message_id = reply.map_or("n/a", |r| r.message_id.as_str()),
            "Unhandled reply message"
        );
    }
}

/// How a waiter ended, as seen by its stream once the sender is gone
#[derive(Default)]
struct WaiterSignals {
    overflowed: AtomicBool,
    timed_out: AtomicBool,
}

struct ReplyWaiter {
    /// Distinguishes this waiter from a later one registered under the same id
    token: u64,
    tx: mpsc::Sender<DeviceMessageReply>,
    deadline: Instant,
    signals: Arc<WaiterSignals>,
    /// Fragments still expected, seeded from the first fragment seen
    remaining: Option<i64>,
}

impl ReplyWaiter {
    /// Flag the waiter as timed out if its deadline has passed
    fn expire_if_due(&self) -> bool {
        if Instant::now() < self.deadline {
            return false;
        }
        self.signals.timed_out.store(true, Ordering::Release);
        true
    }
}

/// Result of pushing one reply into a located waiter
enum Push {
    Delivered { remaining: i64 },
    Completed,
    /// Receiver already gone
    Dead,
    Overflowed(DeviceMessageReply),
    /// Deadline passed before the reply arrived; the reply is handed back
    Expired(DeviceMessageReply),
}

pub struct ReplyCorrelator {
    waiters: CorrelationTable<String, ReplyWaiter>,
    next_token: AtomicU64,
    buffer_capacity: usize,
    failure_handler: RwLock<Arc<dyn ReplyFailureHandler>>,
}

impl ReplyCorrelator {
    pub const DEFAULT_BUFFER_CAPACITY: usize = 256;

    #[must_use]
    pub fn new(buffer_capacity: usize) -> Self {
        Self {
            waiters: CorrelationTable::new(),
            next_token: AtomicU64::new(1),
            buffer_capacity: buffer_capacity.max(1),
            failure_handler: RwLock::new(Arc::new(LogReplyFailure)),
        }
    }

    pub fn set_failure_handler(&self, handler: Arc<dyn ReplyFailureHandler>) {
        *self.failure_handler.write() = handler;
    }

    /// Route a processing failure to the configured handler
    pub fn report_failure(&self, error: &Error, reply: Option<&DeviceMessageReply>) {
        let handler = self.failure_handler.read().clone();
        handler.handle(error, reply);
    }

    /// Register a waiter for `message_id` and return the stream of its replies
    ///
    /// The waiter exists as soon as this returns, so the command may be sent
    /// right after. The stream yields every reply pushed to the waiter, then
    /// ends; it yields [`Error::TimedOut`] if the waiter has not completed
    /// within `timeout`. The timer starts here, not at the first poll.
    ///
    /// There is at most one waiter per message id: a second registration for
    /// an id that already has a live waiter yields [`Error::DuplicateWaiter`]
    /// and leaves the first one untouched, since replies are unicast to one
    /// consumer.
    pub fn register(&self, message_id: &str, timeout: Duration) -> ReplyStream {
        if message_id.is_empty() {
            warn!("Refusing to wait for a reply without a message id");
            return ReplyStream::failed(
                message_id,
                Error::MalformedMessage("empty message id".to_string()),
            );
        }

        let (tx, rx) = mpsc::channel(self.buffer_capacity);
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let deadline = deadline_after(timeout);
        let signals = Arc::new(WaiterSignals::default());
        let waiter = ReplyWaiter {
            token,
            tx,
            deadline,
            signals: signals.clone(),
            remaining: None,
        };

        if self
            .waiters
            .insert_if_absent(message_id.to_string(), waiter)
            .is_err()
        {
            warn!(message_id = %message_id, "Reply waiter already registered");
            return ReplyStream::failed(message_id, Error::DuplicateWaiter(message_id.to_string()));
        }

        debug!(
            message_id = %message_id,
            timeout_ms = timeout.as_millis() as u64,
            "Reply waiter registered"
        );

        ReplyStream {
            message_id: message_id.to_string(),
            rx: Some(rx),
            deadline,
            timer: None,
            registration: Some(Registration {
                waiters: self.waiters.clone(),
                token,
            }),
            signals,
            pending_error: None,
            finished: false,
        }
    }

    /// Hand `reply` to the local waiter it belongs to
    ///
    /// Returns whether a local waiter was found. Replies nobody here waits
    /// for are dropped; every node sees every reply on the shared topic.
    pub fn deliver(&self, reply: DeviceMessageReply) -> bool {
        if reply.message_id.is_empty() {
            warn!(device_id = %reply.device_id, "Reply message id is empty, rejected");
            return false;
        }

        match self.try_deliver(reply) {
            None => true,
            Some(unclaimed) => {
                debug!(message_id = %unclaimed.message_id, "No local waiter for reply, dropped");
                false
            }
        }
    }

    /// Deliver `reply` if a local waiter claims it, otherwise hand it back
    ///
    /// Lookup and push happen under one table operation, so a waiter that
    /// times out concurrently either receives the reply or is not found.
    /// A waiter past its deadline is evicted and the reply handed back.
    /// The waiter is resolved by fragment group id first, then by message id.
    pub fn try_deliver(&self, reply: DeviceMessageReply) -> Option<DeviceMessageReply> {
        let group = reply.fragment_group().map(str::to_owned);
        let fragment = group
            .as_ref()
            .map(|_| (reply.fragment_total(), reply.is_last_fragment()));
        let message_id = reply.message_id.clone();

        let mut slot = Some(reply);
        let mut outcome = None;
        if let Some(group) = &group {
            outcome = self
                .waiters
                .update(group, |waiter| Self::push(waiter, &mut slot, fragment))
                .map(|push| (group.as_str(), push));
        }
        if outcome.is_none() {
            outcome = self
                .waiters
                .update(&message_id, |waiter| Self::push(waiter, &mut slot, fragment))
                .map(|push| (message_id.as_str(), push));
        }

        let Some((key, push)) = outcome else {
            return slot.take();
        };

        match push {
            Push::Expired(reply) => {
                debug!(message_id = %key, "Reply arrived after waiter deadline, waiter evicted");
                return Some(reply);
            }
            Push::Delivered { remaining } => {
                debug!(
                    message_id = %key,
                    fragment_id = %message_id,
                    remaining = remaining,
                    "Reply fragment delivered"
                );
            }
            Push::Completed => {
                debug!(message_id = %key, "Reply waiter completed");
            }
            Push::Dead => {
                debug!(message_id = %key, "Reply waiter already closed, removed");
            }
            Push::Overflowed(reply) => {
                self.report_failure(&Error::ReplyBufferFull(key.to_string()), Some(&reply));
            }
        }
        None
    }

    fn push(
        waiter: &mut ReplyWaiter,
        slot: &mut Option<DeviceMessageReply>,
        fragment: Option<(i64, bool)>,
    ) -> (Push, Retain) {
        let Some(reply) = slot.take() else {
            return (Push::Dead, Retain::Keep);
        };
        if waiter.expire_if_due() {
            return (Push::Expired(reply), Retain::Remove);
        }

        match waiter.tx.try_send(reply) {
            Ok(()) => {}
            Err(TrySendError::Closed(_)) => return (Push::Dead, Retain::Remove),
            Err(TrySendError::Full(reply)) => {
                waiter.signals.overflowed.store(true, Ordering::Release);
                return (Push::Overflowed(reply), Retain::Remove);
            }
        }

        let Some((total, last)) = fragment else {
            return (Push::Completed, Retain::Remove);
        };

        let remaining = waiter.remaining.get_or_insert(total);
        *remaining -= 1;
        if *remaining <= 0 || last {
            (Push::Completed, Retain::Remove)
        } else {
            (
                Push::Delivered {
                    remaining: *remaining,
                },
                Retain::Keep,
            )
        }
    }

    /// Whether a waiter for `message_id` is still within its deadline
    ///
    /// An expired waiter found here is evicted.
    #[must_use]
    pub fn has_waiter(&self, message_id: &str) -> bool {
        let key = message_id.to_string();
        self.waiters.remove_if(&key, ReplyWaiter::expire_if_due);
        self.waiters.contains(&key)
    }

    /// Number of replies currently awaited, after evicting expired waiters
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters.retain(|_, waiter| !waiter.expire_if_due());
        self.waiters.len()
    }
}

/// `timeout` from now, saturating far in the future
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30))
}

impl Default for ReplyCorrelator {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUFFER_CAPACITY)
    }
}

struct Registration {
    waiters: CorrelationTable<String, ReplyWaiter>,
    token: u64,
}

impl Registration {
    fn release(self, message_id: &str) {
        let token = self.token;
        if self
            .waiters
            .remove_if(&message_id.to_string(), |waiter| waiter.token == token)
            .is_some()
        {
            debug!(message_id = %message_id, "Reply waiter released");
        }
    }
}

/// Replies for one message id, in arrival order
///
/// Dropping the stream releases the waiter. The timer is armed on first poll,
/// so a stream may be created outside a Tokio runtime.
pub struct ReplyStream {
    message_id: String,
    rx: Option<mpsc::Receiver<DeviceMessageReply>>,
    deadline: Instant,
    timer: Option<Pin<Box<Sleep>>>,
    registration: Option<Registration>,
    signals: Arc<WaiterSignals>,
    pending_error: Option<Error>,
    finished: bool,
}

impl ReplyStream {
    fn failed(message_id: &str, error: Error) -> Self {
        Self {
            message_id: message_id.to_string(),
            rx: None,
            deadline: Instant::now(),
            timer: None,
            registration: None,
            signals: Arc::new(WaiterSignals::default()),
            pending_error: Some(error),
            finished: false,
        }
    }

    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    fn finish(&mut self) {
        self.finished = true;
        self.rx = None;
        self.timer = None;
        if let Some(registration) = self.registration.take() {
            registration.release(&self.message_id);
        }
    }
}

impl Stream for ReplyStream {
    type Item = Result<DeviceMessageReply>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(error) = this.pending_error.take() {
            this.finish();
            return Poll::Ready(Some(Err(error)));
        }
        if this.finished {
            return Poll::Ready(None);
        }

        if let Some(rx) = this.rx.as_mut() {
            match rx.poll_recv(cx) {
                Poll::Ready(Some(reply)) => return Poll::Ready(Some(Ok(reply))),
                Poll::Ready(None) => {
                    // Sender dropped: the waiter was completed or evicted
                    this.finish();
                    if this.signals.overflowed.load(Ordering::Acquire) {
                        return Poll::Ready(Some(Err(Error::ReplyBufferFull(
                            this.message_id.clone(),
                        ))));
                    }
                    if this.signals.timed_out.load(Ordering::Acquire) {
                        return Poll::Ready(Some(Err(Error::TimedOut(this.message_id.clone()))));
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => {}
            }
        }

        let deadline = this.deadline;
        let timer = this
            .timer
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        if timer.as_mut().poll(cx).is_ready() {
            this.finish();
            debug!(message_id = %this.message_id, "Timed out waiting for reply");
            return Poll::Ready(Some(Err(Error::TimedOut(this.message_id.clone()))));
        }

        Poll::Pending
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.take() {
            registration.release(&self.message_id);
        }
    }
}
