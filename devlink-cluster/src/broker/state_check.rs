//! Distributed "is this device online" checks
//!
//! A check for devices owned by another server is published on that
//! server's checker topic; the owner answers once, with the complete result
//! set, on the requester's result topic. Slow or unreachable owners yield an
//! empty result instead of an error.

use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::correlation::CorrelationTable;
use super::listener::{spawn_listener, ListenerHandle};
use super::topics;
use crate::bus::TopicBus;
use crate::error::{Error, Result};
use crate::message::{self, DeviceCheckRequest, DeviceCheckResponse, DeviceStateInfo};

/// This process's view of the devices it owns
pub trait StateChecker: Send + Sync {
    fn check(&self, device_ids: Vec<String>) -> BoxStream<'static, DeviceStateInfo>;
}

impl<F> StateChecker for F
where
    F: Fn(Vec<String>) -> BoxStream<'static, DeviceStateInfo> + Send + Sync,
{
    fn check(&self, device_ids: Vec<String>) -> BoxStream<'static, DeviceStateInfo> {
        self(device_ids)
    }
}

type CheckWaiters = CorrelationTable<String, oneshot::Sender<DeviceCheckResponse>>;

pub struct StateCheckCoordinator {
    server_id: String,
    bus: Arc<dyn TopicBus>,
    waiters: CheckWaiters,
    /// Set once at startup
    local_checker: OnceLock<Arc<dyn StateChecker>>,
    timeout: Duration,
    /// Parent of every check handler listener
    cancel_token: CancellationToken,
}

impl StateCheckCoordinator {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(server_id: impl Into<String>, bus: Arc<dyn TopicBus>, timeout: Duration) -> Self {
        Self {
            server_id: server_id.into(),
            bus,
            waiters: CorrelationTable::new(),
            local_checker: OnceLock::new(),
            timeout,
            cancel_token: CancellationToken::new(),
        }
    }

    /// States of `device_ids` as reported by `owner_server_id`
    ///
    /// Checks for this server run the local checker directly. Remote checks
    /// start when the stream is first polled and give up after the configured
    /// timeout with an empty stream. Dropping the stream early releases the
    /// pending request.
    pub fn check_state(
        &self,
        owner_server_id: &str,
        device_ids: Vec<String>,
    ) -> BoxStream<'static, DeviceStateInfo> {
        if owner_server_id == self.server_id {
            if let Some(checker) = self.local_checker.get() {
                debug!(devices = device_ids.len(), "Checking device state locally");
                return checker.check(device_ids);
            }
        }

        let request = DeviceCheckRequest {
            from: self.server_id.clone(),
            request_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_ids,
        };
        let bus = self.bus.clone();
        let waiters = self.waiters.clone();
        let topic = topics::checker(owner_server_id);
        let timeout = self.timeout;

        futures::stream::once(async move { remote_check(bus, waiters, topic, request, timeout).await })
            .flat_map(futures::stream::iter)
            .boxed()
    }

    /// Hand an inbound response to the check awaiting it
    pub fn complete(&self, response: DeviceCheckResponse) -> bool {
        let Some(tx) = self.waiters.remove_if_present(&response.request_id) else {
            debug!(request_id = %response.request_id, "No pending check for response, dropped");
            return false;
        };
        let request_id = response.request_id.clone();
        if tx.send(response).is_err() {
            debug!(request_id = %request_id, "Check requester already gone");
        }
        true
    }

    /// Install `checker` as this process's state checker and answer requests
    /// arriving on `local_server_id`'s checker topic
    ///
    /// Only one checker may be installed per process; a second call is a
    /// configuration error.
    pub async fn register_state_handler(
        &self,
        local_server_id: &str,
        checker: Arc<dyn StateChecker>,
    ) -> Result<ListenerHandle> {
        if self.local_checker.get().is_some() {
            return Err(Error::Configuration(
                "a local state checker is already registered".to_string(),
            ));
        }

        let topic = topics::checker(local_server_id);
        let requests = self.bus.subscribe(&topic).await?;

        if self.local_checker.set(checker.clone()).is_err() {
            return Err(Error::Configuration(
                "a local state checker is already registered".to_string(),
            ));
        }

        info!(topic = %topic, "State check handler registered");

        let cancel = self.cancel_token.child_token();
        let bus = self.bus.clone();
        spawn_listener(self.bus.clone(), topic, requests, cancel.clone(), move |payload| {
            match message::decode::<DeviceCheckRequest>(&payload) {
                Ok(request) => {
                    tokio::spawn(answer_check(bus.clone(), checker.clone(), request));
                }
                Err(e) => warn!(error = %e, "Invalid device check request"),
            }
        });

        Ok(ListenerHandle::new(cancel))
    }

    /// Number of remote checks awaiting a response
    #[must_use]
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }

    /// Stop answering check requests
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

/// Evicts a check waiter on every exit path, including cancellation
struct CheckWaiterGuard {
    waiters: CheckWaiters,
    request_id: String,
}

impl Drop for CheckWaiterGuard {
    fn drop(&mut self) {
        self.waiters.remove_if_present(&self.request_id);
    }
}

async fn remote_check(
    bus: Arc<dyn TopicBus>,
    waiters: CheckWaiters,
    topic: String,
    request: DeviceCheckRequest,
    timeout: Duration,
) -> Vec<DeviceStateInfo> {
    let request_id = request.request_id.clone();
    let (tx, rx) = oneshot::channel();
    if waiters.insert_if_absent(request_id.clone(), tx).is_err() {
        warn!(request_id = %request_id, "Duplicate device check request id");
        return Vec::new();
    }
    let _guard = CheckWaiterGuard {
        waiters,
        request_id: request_id.clone(),
    };

    let exchange = async {
        let payload = match message::encode(&request) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode device check request");
                return Vec::new();
            }
        };

        match bus.publish(&topic, payload).await {
            Ok(0) => {
                warn!(topic = %topic, request_id = %request_id, "Device check request reached no receivers");
                return Vec::new();
            }
            Ok(_) => {}
            Err(e) => {
                warn!(topic = %topic, error = %e, "Failed to publish device check request");
                return Vec::new();
            }
        }

        rx.await
            .map(|response| response.state_info_list)
            .unwrap_or_default()
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(states) => states,
        Err(_) => {
            debug!(topic = %topic, request_id = %request_id, "Device check timed out, answering empty");
            Vec::new()
        }
    }
}

async fn answer_check(bus: Arc<dyn TopicBus>, checker: Arc<dyn StateChecker>, request: DeviceCheckRequest) {
    let DeviceCheckRequest {
        from,
        request_id,
        device_id,
    } = request;

    let states: Vec<DeviceStateInfo> = checker.check(device_id).collect().await;
    let response = DeviceCheckResponse {
        request_id,
        state_info_list: states,
    };

    let payload = match message::encode(&response) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to encode device check response");
            return;
        }
    };

    let topic = topics::check_result(&from);
    match bus.publish(&topic, payload).await {
        Ok(0) => warn!(topic = %topic, request_id = %response.request_id, "Device check reply fail: no receivers"),
        Ok(receivers) => debug!(
            topic = %topic,
            request_id = %response.request_id,
            receivers = receivers,
            "Device check answered"
        ),
        Err(e) => warn!(topic = %topic, error = %e, "Failed to publish device check response"),
    }
}
