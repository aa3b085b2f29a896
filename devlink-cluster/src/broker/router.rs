use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

use super::topics;
use crate::bus::TopicBus;
use crate::error::Result;
use crate::message::{self, headers, BroadcastMessage, DeviceMessage, DeviceMessageReply, Message};

/// Send, broadcast and receive over the cluster's fixed topic names
///
/// Transport failures come back as zero counts or `false`, never as errors.
#[derive(Clone)]
pub struct MessageRouter {
    server_id: String,
    bus: Arc<dyn TopicBus>,
}

impl MessageRouter {
    pub fn new(server_id: impl Into<String>, bus: Arc<dyn TopicBus>) -> Self {
        Self {
            server_id: server_id.into(),
            bus,
        }
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Send commands to the server owning their devices
    ///
    /// Each message is stamped with `sendFrom` and published in order on the
    /// target's point-to-point topic. Stops at the first publish that reaches
    /// nobody and returns 0; otherwise returns the receiver count of the last
    /// publish (0 for no messages).
    pub async fn send<I>(&self, target_server_id: &str, messages: I) -> usize
    where
        I: IntoIterator<Item = DeviceMessage>,
    {
        let topic = topics::p2p(target_server_id);
        let mut receivers = 0;

        for mut msg in messages {
            msg.add_header(headers::SEND_FROM, self.server_id.as_str());
            receivers = self.publish(&topic, &msg).await;
            if receivers == 0 {
                warn!(
                    topic = %topic,
                    message_id = %msg.message_id,
                    "Device message reached no receivers, send aborted"
                );
                return 0;
            }
        }

        receivers
    }

    /// Publish notifications on the shared broadcast topic
    ///
    /// Returns the total number of deliveries across all messages.
    pub async fn broadcast<I>(&self, messages: I) -> usize
    where
        I: IntoIterator<Item = BroadcastMessage>,
    {
        let mut delivered = 0;
        for msg in messages {
            delivered += self.publish(topics::BROADCAST, &msg).await;
        }
        delivered
    }

    /// Publish a reply on the shared reply topic
    pub async fn publish_reply(&self, reply: &DeviceMessageReply) -> bool {
        self.publish(topics::REPLY, reply).await > 0
    }

    /// Commands addressed to `server_id`, live while the stream is held
    pub async fn receive_inbound(&self, server_id: &str) -> Result<BoxStream<'static, DeviceMessage>> {
        self.subscribe_decoded(&topics::p2p(server_id)).await
    }

    /// Cluster-wide notifications, live while the stream is held
    pub async fn receive_broadcast(&self) -> Result<BoxStream<'static, BroadcastMessage>> {
        self.subscribe_decoded(topics::BROADCAST).await
    }

    async fn publish<M>(&self, topic: &str, msg: &M) -> usize
    where
        M: Message + serde::Serialize,
    {
        let payload = match message::encode(msg) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic = %topic, message_id = %msg.message_id(), error = %e, "Failed to encode message");
                return 0;
            }
        };

        match self.bus.publish(topic, payload).await {
            Ok(receivers) => {
                debug!(
                    topic = %topic,
                    message_id = %msg.message_id(),
                    receivers = receivers,
                    "Message published"
                );
                receivers
            }
            Err(e) => {
                warn!(topic = %topic, message_id = %msg.message_id(), error = %e, "Failed to publish message");
                0
            }
        }
    }

    async fn subscribe_decoded<T>(&self, topic: &str) -> Result<BoxStream<'static, T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let stream = self.bus.subscribe(topic).await?;
        let topic = topic.to_string();

        Ok(stream
            .filter_map(move |payload| {
                let item = match message::decode::<T>(&payload) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Dropping undecodable message");
                        None
                    }
                };
                futures::future::ready(item)
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, MockTopicBus};
    use bytes::Bytes;
    use serde_json::json;

    fn command(id: &str) -> DeviceMessage {
        DeviceMessage::new("dev1", json!({ "function": "reboot" })).with_message_id(id)
    }

    #[tokio::test]
    async fn test_send_stamps_origin_and_uses_p2p_topic() {
        let bus = Arc::new(LocalBus::new());
        let router = MessageRouter::new("A", bus.clone());
        let mut inbound = router.receive_inbound("B").await.unwrap();

        let receivers = router.send("B", vec![command("M1")]).await;
        assert_eq!(receivers, 1);

        let received = inbound.next().await.unwrap();
        assert_eq!(received.message_id, "M1");
        assert_eq!(received.headers.send_from(), Some("A"));
    }

    #[tokio::test]
    async fn test_send_fails_fast_on_zero_receivers() {
        let mut bus = MockTopicBus::new();
        bus.expect_publish()
            .withf(|topic, _| topic == "device:msg:p2p:B")
            .times(1)
            .returning(|_, _| Ok(0));

        let router = MessageRouter::new("A", Arc::new(bus));
        let receivers = router.send("B", vec![command("M1"), command("M2")]).await;
        assert_eq!(receivers, 0);
    }

    #[tokio::test]
    async fn test_send_transport_error_counts_as_zero() {
        let mut bus = MockTopicBus::new();
        bus.expect_publish()
            .times(1)
            .returning(|_, _| Err(crate::Error::Transport("connection reset".to_string())));

        let router = MessageRouter::new("A", Arc::new(bus));
        assert_eq!(router.send("B", vec![command("M1")]).await, 0);
    }

    #[tokio::test]
    async fn test_send_nothing_returns_zero() {
        let router = MessageRouter::new("A", Arc::new(LocalBus::new()));
        assert_eq!(router.send("B", Vec::<DeviceMessage>::new()).await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_counts_deliveries() {
        let bus = Arc::new(LocalBus::new());
        let router = MessageRouter::new("A", bus.clone());
        let mut first = router.receive_broadcast().await.unwrap();
        let _second = router.receive_broadcast().await.unwrap();

        let delivered = router
            .broadcast(vec![
                BroadcastMessage::new(json!({ "event": "firmware" })),
                BroadcastMessage::new(json!({ "event": "config" })),
            ])
            .await;
        assert_eq!(delivered, 4);
        assert_eq!(first.next().await.unwrap().payload["event"], "firmware");
    }

    #[tokio::test]
    async fn test_inbound_skips_undecodable_payloads() {
        let bus = Arc::new(LocalBus::new());
        let router = MessageRouter::new("B", bus.clone());
        let mut inbound = router.receive_inbound("B").await.unwrap();

        bus.publish("device:msg:p2p:B", Bytes::from_static(b"{broken"))
            .await
            .unwrap();
        router.send("B", vec![command("M2")]).await;

        assert_eq!(inbound.next().await.unwrap().message_id, "M2");
    }
}
