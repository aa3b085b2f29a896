//! Named pub/sub topics shared by every node in the cluster
//!
//! The broker only needs two primitives from its transport: publish a payload
//! and learn how many subscribers received it, and subscribe to a live stream
//! of payloads. Encoding happens above this layer.

pub mod local;
pub mod redis_pubsub;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;

pub use self::local::LocalBus;
pub use self::redis_pubsub::RedisBus;

/// Live multicast stream of raw payloads for one topic
///
/// Ends when the transport loses the subscription.
pub type TopicStream = BoxStream<'static, Bytes>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TopicBus: Send + Sync {
    /// Publish `payload` on `topic`, returning how many subscribers received it
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize>;

    /// Subscribe to `topic`; the subscription is live once this returns
    async fn subscribe(&self, topic: &str) -> Result<TopicStream>;
}
