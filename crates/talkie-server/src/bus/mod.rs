//! Cross-process fan-out bus.
//!
//! Every locally generated event is published to the bus, and one
//! subscription per process delivers what it receives (including its own
//! publications) into the local [`crate::websocket::registry::Registry`].
//! Delivery is best-effort: no retry, no buffering, no ordering across
//! publishers.

pub mod bridge;
pub mod local;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use talkie_core::{BusError, Envelope, UserId};

pub use bridge::{BusBridge, Publisher};
pub use local::LocalBus;

/// An event plus its optional single target user, as carried on the bus.
///
/// Wire form: `{"target_user_id": "<id>", "event": {"type", "payload"}}`,
/// with `target_user_id` omitted for broadcasts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    /// Point-to-point target; `None` broadcasts to every local connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<UserId>,
    /// The event to deliver.
    pub event: Envelope,
}

impl BusMessage {
    /// Message addressed to one user.
    pub fn to_user(user_id: UserId, event: Envelope) -> Self {
        Self {
            target_user_id: Some(user_id),
            event,
        }
    }

    /// Message for every connection on every process.
    pub fn broadcast(event: Envelope) -> Self {
        Self {
            target_user_id: None,
            event,
        }
    }

    /// Encode for the wire.
    pub fn encode(&self) -> Result<String, BusError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a wire payload.
    pub fn decode(payload: &[u8]) -> Result<Self, BusError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Stream of received bus messages. Items that fail to decode are yielded as
/// errors and skipped by the bridge.
pub type BusStream = BoxStream<'static, Result<BusMessage, BusError>>;

/// A publish/subscribe channel shared by every hub process.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Backend name for logs.
    fn name(&self) -> &'static str;

    /// Publish `message` to every subscriber, this process included.
    async fn publish(&self, message: &BusMessage) -> Result<(), BusError>;

    /// Open a subscription. The stream ends if the backend drops it.
    async fn subscribe(&self) -> Result<BusStream, BusError>;
}
