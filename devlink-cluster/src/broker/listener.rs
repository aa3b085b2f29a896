use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{TopicBus, TopicStream};

/// Initial backoff delay before resubscribing
const INITIAL_BACKOFF_SECS: u64 = 1;

/// Maximum backoff delay before resubscribing
const MAX_BACKOFF_SECS: u64 = 30;

/// Cancels a background subscription when asked to
#[derive(Debug, Clone)]
pub struct ListenerHandle {
    cancel: CancellationToken,
}

impl ListenerHandle {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Drive `initial` until cancelled, resubscribing to `topic` whenever the
/// transport ends the stream
///
/// `on_payload` runs inline for every payload, so one slow payload delays
/// the next; callers that do real work spawn from it.
pub(crate) fn spawn_listener<F>(
    bus: Arc<dyn TopicBus>,
    topic: String,
    initial: TopicStream,
    cancel: CancellationToken,
    on_payload: F,
) -> JoinHandle<()>
where
    F: Fn(Bytes) + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff_secs = INITIAL_BACKOFF_SECS;
        let mut current = Some(initial);

        loop {
            if let Some(mut stream) = current.take() {
                loop {
                    let item = tokio::select! {
                        () = cancel.cancelled() => {
                            info!(topic = %topic, "Listener cancelled");
                            return;
                        }
                        item = stream.next() => item,
                    };
                    match item {
                        Some(payload) => on_payload(payload),
                        None => break,
                    }
                }
                // The subscription was healthy before it dropped
                backoff_secs = INITIAL_BACKOFF_SECS;
                warn!(topic = %topic, "Subscription ended, resubscribing");
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!(topic = %topic, "Listener cancelled during backoff");
                    return;
                }
                () = tokio::time::sleep(Duration::from_secs(backoff_secs)) => {}
            }

            match bus.subscribe(&topic).await {
                Ok(stream) => {
                    info!(topic = %topic, "Resubscribed");
                    current = Some(stream);
                }
                Err(e) => {
                    error!(
                        topic = %topic,
                        error = %e,
                        backoff_secs = backoff_secs,
                        "Failed to resubscribe, retrying after backoff"
                    );
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                }
            }
        }
    })
}
