use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use super::{TopicBus, TopicStream};
use crate::error::Result;

/// In-process bus for single-node deployments and tests
///
/// Every topic is a `tokio::sync::broadcast` channel. Nodes that share one
/// `LocalBus` behave like cluster members on a common transport.
#[derive(Clone)]
pub struct LocalBus {
    topics: Arc<DashMap<String, broadcast::Sender<Bytes>>>,
    capacity: usize,
}

impl LocalBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Bytes> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Number of live subscribers on `topic`
    #[must_use]
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map_or(0, |sender| sender.receiver_count())
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TopicBus for LocalBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize> {
        let sender = self.sender_for(topic);
        // send only fails when there are no receivers
        let receivers = sender.send(payload).unwrap_or(0);
        debug!(topic = %topic, receivers = receivers, "Published to local topic");
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicStream> {
        let rx = self.sender_for(topic).subscribe();
        let topic = topic.to_string();

        let stream = BroadcastStream::new(rx).filter_map(move |item| {
            let item = match item {
                Ok(payload) => Some(payload),
                Err(err) => {
                    warn!(topic = %topic, error = %err, "Local subscriber lagged, messages skipped");
                    None
                }
            };
            futures::future::ready(item)
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reports_receiver_count() {
        let bus = LocalBus::new();
        assert_eq!(bus.publish("device:msg:broadcast", Bytes::from_static(b"x")).await.unwrap(), 0);

        let mut sub1 = bus.subscribe("device:msg:broadcast").await.unwrap();
        let _sub2 = bus.subscribe("device:msg:broadcast").await.unwrap();
        assert_eq!(bus.subscriber_count("device:msg:broadcast"), 2);

        let receivers = bus
            .publish("device:msg:broadcast", Bytes::from_static(b"ping"))
            .await
            .unwrap();
        assert_eq!(receivers, 2);
        assert_eq!(sub1.next().await.unwrap(), Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_counting() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("device:msg:reply").await.unwrap();
        drop(sub);

        let receivers = bus
            .publish("device:msg:reply", Bytes::from_static(b"late"))
            .await
            .unwrap();
        assert_eq!(receivers, 0);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = LocalBus::new();
        let mut a = bus.subscribe("device:msg:p2p:a").await.unwrap();
        let _b = bus.subscribe("device:msg:p2p:b").await.unwrap();

        bus.publish("device:msg:p2p:b", Bytes::from_static(b"for-b")).await.unwrap();
        bus.publish("device:msg:p2p:a", Bytes::from_static(b"for-a")).await.unwrap();

        assert_eq!(a.next().await.unwrap(), Bytes::from_static(b"for-a"));
    }
}
