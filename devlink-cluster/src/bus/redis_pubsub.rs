use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client as RedisClient};
use tokio::time::{timeout, Duration};
use tracing::{debug, info, warn};

use super::{TopicBus, TopicStream};
use crate::error::{Error, Result};

/// Default timeout for Redis operations in seconds
const REDIS_TIMEOUT_SECS: u64 = 5;

/// Redis Pub/Sub transport
///
/// Topic names map one-to-one onto Redis channels. `PUBLISH` already replies
/// with the number of receiving clients, which is the count the broker needs.
/// Each subscription owns a dedicated pub/sub connection.
pub struct RedisBus {
    redis_client: RedisClient,
    conn: ConnectionManager,
    op_timeout: Duration,
}

impl RedisBus {
    /// Connect to Redis with the default operation timeout
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Self::connect_with_timeout(redis_url, Duration::from_secs(REDIS_TIMEOUT_SECS)).await
    }

    pub async fn connect_with_timeout(redis_url: &str, op_timeout: Duration) -> Result<Self> {
        let redis_client = RedisClient::open(redis_url)
            .map_err(|e| Error::Configuration(format!("Failed to create Redis client: {e}")))?;

        let conn = timeout(op_timeout, ConnectionManager::new(redis_client.clone()))
            .await
            .map_err(|_| Error::Transport("Timed out connecting to Redis".to_string()))??;

        info!("Redis bus connected");

        Ok(Self {
            redis_client,
            conn,
            op_timeout,
        })
    }
}

#[async_trait]
impl TopicBus for RedisBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<usize> {
        let mut conn = self.conn.clone();
        let receivers: usize = timeout(self.op_timeout, conn.publish(topic, payload.as_ref()))
            .await
            .map_err(|_| Error::Transport(format!("Timed out publishing to {topic}")))??;

        debug!(topic = %topic, receivers = receivers, "Published to Redis channel");
        Ok(receivers)
    }

    async fn subscribe(&self, topic: &str) -> Result<TopicStream> {
        let mut pubsub = timeout(self.op_timeout, self.redis_client.get_async_pubsub())
            .await
            .map_err(|_| Error::Transport("Timed out getting Redis Pub/Sub connection".to_string()))??;

        timeout(self.op_timeout, pubsub.subscribe(topic))
            .await
            .map_err(|_| Error::Transport(format!("Timed out subscribing to {topic}")))??;

        debug!(topic = %topic, "Subscribed to Redis channel");

        let stream = pubsub.into_on_message().filter_map(|msg| {
            let payload = match msg.get_payload::<Vec<u8>>() {
                Ok(bytes) => Some(Bytes::from(bytes)),
                Err(e) => {
                    warn!(
                        error = %e,
                        channel = %msg.get_channel_name(),
                        "Invalid payload"
                    );
                    None
                }
            };
            futures::future::ready(payload)
        });

        Ok(stream.boxed())
    }
}
