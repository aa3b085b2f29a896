//! Cluster device operation broker
//!
//! Single entry point for a server instance:
//! - sending commands to devices owned by other servers
//! - cluster-wide broadcast
//! - correlating (possibly fragmented) replies with the caller awaiting them
//! - distributed device state checks

use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::{spawn_listener, ListenerHandle};
use super::reply::{ReplyCorrelator, ReplyFailureHandler, ReplyStream};
use super::router::MessageRouter;
use super::state_check::{StateCheckCoordinator, StateChecker};
use super::topics;
use crate::bus::{LocalBus, RedisBus, TopicBus};
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::message::{
    self, headers, BroadcastMessage, DeviceCheckResponse, DeviceMessage, DeviceMessageReply,
    DeviceStateInfo, Message,
};

pub struct DeviceOperationBroker {
    server_id: String,
    router: MessageRouter,
    replies: Arc<ReplyCorrelator>,
    checks: Arc<StateCheckCoordinator>,
    /// Stops the permanent reply and check-result listeners
    cancel_token: CancellationToken,
}

impl DeviceOperationBroker {
    /// Create a broker on `bus`
    ///
    /// Subscribes to the shared reply topic and this server's check-result
    /// topic before returning; both subscriptions live until [`shutdown`]
    /// or drop.
    ///
    /// [`shutdown`]: Self::shutdown
    pub async fn new(bus: Arc<dyn TopicBus>, config: &BrokerConfig) -> Result<Self> {
        config.validate()?;

        let server_id = config.server_id.clone();
        let replies = Arc::new(ReplyCorrelator::new(config.reply_buffer_capacity));
        let checks = Arc::new(StateCheckCoordinator::new(
            server_id.clone(),
            bus.clone(),
            config.state_check_timeout(),
        ));
        let cancel_token = CancellationToken::new();

        let reply_stream = bus.subscribe(topics::REPLY).await?;
        let result_topic = topics::check_result(&server_id);
        let result_stream = bus.subscribe(&result_topic).await?;

        let reply_sink = replies.clone();
        spawn_listener(
            bus.clone(),
            topics::REPLY.to_string(),
            reply_stream,
            cancel_token.child_token(),
            move |payload| match message::decode::<DeviceMessageReply>(&payload) {
                Ok(reply) => {
                    reply_sink.deliver(reply);
                }
                Err(e) => reply_sink.report_failure(&e, None),
            },
        );

        let check_sink = checks.clone();
        spawn_listener(
            bus.clone(),
            result_topic,
            result_stream,
            cancel_token.child_token(),
            move |payload| match message::decode::<DeviceCheckResponse>(&payload) {
                Ok(response) => {
                    check_sink.complete(response);
                }
                Err(e) => warn!(error = %e, "Invalid device check response"),
            },
        );

        info!(server_id = %server_id, "Device operation broker started");

        Ok(Self {
            router: MessageRouter::new(server_id.clone(), bus),
            server_id,
            replies,
            checks,
            cancel_token,
        })
    }

    /// Create a broker on the transport named by `config`
    ///
    /// Without a Redis URL the broker runs single-node on an in-process bus.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let bus: Arc<dyn TopicBus> = if config.redis_enabled() {
            Arc::new(
                RedisBus::connect_with_timeout(
                    &config.redis.url,
                    Duration::from_secs(config.redis.operation_timeout_seconds),
                )
                .await?,
            )
        } else {
            warn!("Redis URL not provided, running in single-node mode");
            Arc::new(LocalBus::with_capacity(config.local_bus_capacity))
        };

        Self::new(bus, config).await
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// States of `device_ids`, asked of the server that owns them
    ///
    /// Never fails: an owner that does not answer in time yields an empty
    /// stream.
    pub fn get_device_state<I, S>(
        &self,
        owner_server_id: &str,
        device_ids: I,
    ) -> BoxStream<'static, DeviceStateInfo>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let device_ids = device_ids.into_iter().map(Into::into).collect();
        self.checks.check_state(owner_server_id, device_ids)
    }

    /// Answer state checks addressed to `server_id` with `checker`
    ///
    /// `checker` also serves local checks for this broker's own server id.
    pub async fn handle_get_device_state(
        &self,
        server_id: &str,
        checker: Arc<dyn StateChecker>,
    ) -> Result<ListenerHandle> {
        self.checks.register_state_handler(server_id, checker).await
    }

    /// Wait for replies to `message_id`; see [`ReplyCorrelator::register`]
    pub fn handle_reply(&self, message_id: &str, timeout: Duration) -> ReplyStream {
        self.replies.register(message_id, timeout)
    }

    /// Send commands to `target_server_id`; 0 means at least one was not received
    pub async fn send<I>(&self, target_server_id: &str, messages: I) -> usize
    where
        I: IntoIterator<Item = DeviceMessage>,
    {
        self.router.send(target_server_id, messages).await
    }

    /// Publish cluster-wide notifications, returning total deliveries
    pub async fn broadcast<I>(&self, messages: I) -> usize
    where
        I: IntoIterator<Item = BroadcastMessage>,
    {
        self.router.broadcast(messages).await
    }

    /// Commands sent to devices owned by `server_id`
    pub async fn handle_send_to_device_message(
        &self,
        server_id: &str,
    ) -> Result<BoxStream<'static, DeviceMessage>> {
        self.router.receive_inbound(server_id).await
    }

    /// Cluster-wide notifications
    pub async fn handle_broadcast(&self) -> Result<BoxStream<'static, BroadcastMessage>> {
        self.router.receive_broadcast().await
    }

    /// Route a device's reply back to whoever is waiting for it
    ///
    /// A waiter in this process receives it directly; otherwise it goes out
    /// on the shared reply topic. Returns false for a reply without a message
    /// id or one that reached no subscriber.
    pub async fn reply(&self, mut message: DeviceMessageReply) -> bool {
        if message.message_id.is_empty() {
            warn!(device_id = %message.device_id, "Reply message id is empty");
            return false;
        }

        message.add_header(headers::REPLY_FROM, self.server_id.as_str());
        let message_id = message.message_id.clone();

        match self.replies.try_deliver(message) {
            None => {
                debug!(message_id = %message_id, "Reply delivered to local waiter");
                true
            }
            Some(message) => self.router.publish_reply(&message).await,
        }
    }

    pub fn set_reply_failure_handler(&self, handler: Arc<dyn ReplyFailureHandler>) {
        self.replies.set_failure_handler(handler);
    }

    #[must_use]
    pub fn has_reply_waiter(&self, message_id: &str) -> bool {
        self.replies.has_waiter(message_id)
    }

    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.replies.pending()
    }

    #[must_use]
    pub fn pending_checks(&self) -> usize {
        self.checks.pending()
    }

    /// Stop the background listeners, including any state check handler
    pub fn shutdown(&self) {
        info!(server_id = %self.server_id, "Shutting down device operation broker");
        self.cancel_token.cancel();
        self.checks.shutdown();
    }
}

impl Drop for DeviceOperationBroker {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        self.checks.shutdown();
    }
}
