//! In-process bus backed by a `tokio::sync::broadcast` channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use metrics::counter;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use talkie_core::BusError;

use super::{BusMessage, BusStream, MessageBus};
use crate::metrics::BUS_RECEIVE_ERRORS_TOTAL;

/// Single-process bus. Messages travel encoded, exactly as they would over a
/// network backend.
pub struct LocalBus {
    tx: broadcast::Sender<Arc<str>>,
}

impl LocalBus {
    /// Create a bus buffering up to `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let payload: Arc<str> = Arc::from(message.encode()?);
        // zero subscribers is not an error: nobody is listening yet
        let _ = self.tx.send(payload);
        Ok(())
    }

    async fn subscribe(&self) -> Result<BusStream, BusError> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(payload) => Some(BusMessage::decode(payload.as_bytes())),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    counter!(BUS_RECEIVE_ERRORS_TOTAL).increment(skipped);
                    warn!(skipped, "local bus subscriber lagged, messages lost");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkie_core::{Envelope, EventKind};

    fn message(n: u64) -> BusMessage {
        BusMessage::to_user(
            "A".into(),
            Envelope::new(EventKind::Typing, serde_json::json!({ "n": n })).unwrap(),
        )
    }

    #[tokio::test]
    async fn subscriber_receives_publications_in_order() {
        let bus = LocalBus::new(16);
        let mut stream = bus.subscribe().await.unwrap();
        bus.publish(&message(1)).await.unwrap();
        bus.publish(&message(2)).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap(), message(1));
        assert_eq!(stream.next().await.unwrap().unwrap(), message(2));
    }

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let bus = LocalBus::new(16);
        let mut s1 = bus.subscribe().await.unwrap();
        let mut s2 = bus.subscribe().await.unwrap();
        bus.publish(&message(9)).await.unwrap();
        assert_eq!(s1.next().await.unwrap().unwrap(), message(9));
        assert_eq!(s2.next().await.unwrap().unwrap(), message(9));
    }

    #[tokio::test]
    async fn publish_without_subscribers_succeeds() {
        let bus = LocalBus::new(4);
        assert!(bus.publish(&message(1)).await.is_ok());
    }

    #[tokio::test]
    async fn lagged_subscriber_skips_lost_messages() {
        let bus = LocalBus::new(2);
        let mut stream = bus.subscribe().await.unwrap();
        for n in 0..5 {
            bus.publish(&message(n)).await.unwrap();
        }
        // the oldest three were overwritten; the newest two survive
        assert_eq!(stream.next().await.unwrap().unwrap(), message(3));
        assert_eq!(stream.next().await.unwrap().unwrap(), message(4));
    }
}
