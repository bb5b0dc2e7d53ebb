//! Redis pub/sub bus, shared by every hub process pointed at the same server.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, info};

use talkie_core::BusError;

use super::{BusMessage, BusStream, MessageBus};

/// Bus over a Redis pub/sub channel.
pub struct RedisBus {
    client: redis::Client,
    channel: String,
    publisher: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBus {
    /// Create a bus for `url` publishing on `channel`. Connects lazily.
    pub fn new(url: &str, channel: impl Into<String>) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Self {
            client,
            channel: channel.into(),
            publisher: Mutex::new(None),
        })
    }

    /// Channel name.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    async fn publish_connection(&self) -> Result<MultiplexedConnection, BusError> {
        let mut slot = self.publisher.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        info!(channel = %self.channel, "redis publish connection established");
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl MessageBus for RedisBus {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let payload = message.encode()?;
        let mut conn = self.publish_connection().await?;
        let result: redis::RedisResult<i64> = conn.publish(&self.channel, payload).await;
        match result {
            Ok(receivers) => {
                debug!(receivers, "published to redis");
                Ok(())
            }
            Err(e) => {
                // drop the cached connection so the next publish reconnects
                *self.publisher.lock().await = None;
                Err(BusError::Publish(e.to_string()))
            }
        }
    }

    async fn subscribe(&self) -> Result<BusStream, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        pubsub
            .subscribe(&self.channel)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        info!(channel = %self.channel, "redis subscription open");
        let stream = pubsub
            .into_on_message()
            .map(|msg| BusMessage::decode(msg.get_payload_bytes()));
        Ok(stream.boxed())
    }
}
