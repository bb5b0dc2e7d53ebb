//! Consumers of registry presence transitions.
//!
//! The registry pushes each transition onto a broadcast channel under its
//! table guard, so both consumers see transitions in the order they happened.
//! Cancellation is honored only once the channel is empty: the consumers
//! stop after the registry has closed every connection, and the `offline`
//! transitions that produced are still delivered.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use talkie_core::envelope::PresencePayload;
use talkie_core::{Envelope, EventKind, PresenceObserver};

use crate::bus::Publisher;
use crate::websocket::registry::PresenceChange;

/// Publish an `online`/`offline` broadcast to the bus for every transition.
#[instrument(skip_all)]
pub async fn announce_presence(
    mut changes: broadcast::Receiver<PresenceChange>,
    publisher: Publisher,
    cancel: CancellationToken,
) {
    while let Some(change) = next_change(&mut changes, &cancel).await {
        let kind = if change.is_online {
            EventKind::Online
        } else {
            EventKind::Offline
        };
        let payload = PresencePayload {
            user_id: change.user_id,
            is_online: change.is_online,
        };
        match Envelope::new(kind, payload) {
            Ok(event) => {
                let _ = publisher.publish(None, event).await;
            }
            Err(e) => warn!(error = %e, "failed to encode presence event"),
        }
    }
    info!("presence announcer stopped");
}

/// Hand every transition to the presence observer. Observer failures are
/// logged and never reach the registry.
#[instrument(skip_all)]
pub async fn forward_presence(
    mut changes: broadcast::Receiver<PresenceChange>,
    observer: Arc<dyn PresenceObserver>,
    cancel: CancellationToken,
) {
    while let Some(change) = next_change(&mut changes, &cancel).await {
        if let Err(e) = observer
            .on_presence_changed(&change.user_id, change.is_online)
            .await
        {
            warn!(
                user_id = %change.user_id,
                is_online = change.is_online,
                error = %e,
                "presence observer failed"
            );
        } else {
            debug!(user_id = %change.user_id, is_online = change.is_online, "presence observed");
        }
    }
    info!("presence forwarder stopped");
}

/// Next queued transition; `None` once cancelled with nothing left queued,
/// or when the registry is gone.
async fn next_change(
    changes: &mut broadcast::Receiver<PresenceChange>,
    cancel: &CancellationToken,
) -> Option<PresenceChange> {
    loop {
        tokio::select! {
            biased;
            received = changes.recv() => match received {
                Ok(change) => return Some(change),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "presence consumer lagged, transitions lost");
                }
                Err(RecvError::Closed) => return None,
            },
            () = cancel.cancelled() => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, LocalBus, MessageBus};
    use futures::StreamExt;
    use std::time::Duration;
    use talkie_core::{InMemoryDirectory, UserId};

    fn change(user: &str, is_online: bool) -> PresenceChange {
        PresenceChange {
            user_id: user.into(),
            is_online,
        }
    }

    #[tokio::test]
    async fn announcer_publishes_presence_broadcasts() {
        let (tx, rx) = broadcast::channel(8);
        let bus = Arc::new(LocalBus::new(8));
        let mut stream = bus.subscribe().await.unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(announce_presence(
            rx,
            Publisher::new(bus.clone()),
            cancel.clone(),
        ));

        let _ = tx.send(change("A", false));
        let _ = tx.send(change("A", true));

        let first: BusMessage = stream.next().await.unwrap().unwrap();
        assert!(first.target_user_id.is_none());
        assert_eq!(
            serde_json::to_value(&first.event).unwrap(),
            serde_json::json!({"type": "offline", "payload": {"user_id": "A", "is_online": false}})
        );
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.event.kind(), Some(EventKind::Online));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn forwarder_invokes_observer_in_order() {
        let (tx, rx) = broadcast::channel(8);
        let directory = Arc::new(InMemoryDirectory::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(forward_presence(rx, directory.clone(), cancel.clone()));

        let _ = tx.send(change("A", true));
        let _ = tx.send(change("B", true));
        let _ = tx.send(change("A", false));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            directory.presence_history(),
            vec![
                (UserId::from("A"), true),
                (UserId::from("B"), true),
                (UserId::from("A"), false),
            ]
        );
    }

    #[tokio::test]
    async fn cancelled_consumers_deliver_queued_transitions_first() {
        let (tx, observe_rx) = broadcast::channel(8);
        let announce_rx = tx.subscribe();
        let directory = Arc::new(InMemoryDirectory::new());
        let bus = Arc::new(LocalBus::new(8));
        let mut stream = bus.subscribe().await.unwrap();
        let _ = tx.send(change("A", false));
        let _ = tx.send(change("B", false));

        // the sender stays open; only the token can end the loops
        let cancel = CancellationToken::new();
        cancel.cancel();
        let forwarder = tokio::spawn(forward_presence(observe_rx, directory.clone(), cancel.clone()));
        let announcer = tokio::spawn(announce_presence(
            announce_rx,
            Publisher::new(bus.clone()),
            cancel,
        ));
        tokio::time::timeout(Duration::from_secs(1), async {
            forwarder.await.unwrap();
            announcer.await.unwrap();
        })
        .await
        .unwrap();

        assert_eq!(
            directory.presence_history(),
            vec![(UserId::from("A"), false), (UserId::from("B"), false)]
        );
        for user in ["A", "B"] {
            let message = stream.next().await.unwrap().unwrap();
            assert_eq!(message.event.kind(), Some(EventKind::Offline));
            assert_eq!(message.event.payload["user_id"], user);
        }
        drop(tx);
    }
}
