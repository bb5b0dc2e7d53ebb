//! Inbound event dispatch.
//!
//! Stateless between events: each envelope is parsed into its typed payload,
//! recipients are resolved, and outbound envelopes are published to the bus.

use std::sync::Arc;

use metrics::counter;
use serde::de::DeserializeOwned;
use tracing::{debug, instrument, warn};

use talkie_core::envelope::{
    ErrorPayload, NewMessageRequest, ReadPayload, ReadRequest, SignalRequest, TypingPayload,
    TypingRequest,
};
use talkie_core::{
    ConversationId, DispatchError, Envelope, EventKind, MembershipLookup, MessageStore,
    NewMessage, ReadTracker, StoreError, UserId,
};

use super::connection::{ClientConnection, Enqueue};
use crate::bus::Publisher;
use crate::metrics::EVENTS_DISPATCHED_TOTAL;

/// Error code sent to the sender when a chat message cannot be saved.
pub const MESSAGE_REJECTED: &str = "message_rejected";

/// Routes inbound envelopes to their recipients.
pub struct EventDispatcher {
    membership: Arc<dyn MembershipLookup>,
    messages: Arc<dyn MessageStore>,
    receipts: Arc<dyn ReadTracker>,
    publisher: Publisher,
}

impl EventDispatcher {
    /// Create a dispatcher over the given collaborators.
    pub fn new(
        membership: Arc<dyn MembershipLookup>,
        messages: Arc<dyn MessageStore>,
        receipts: Arc<dyn ReadTracker>,
        publisher: Publisher,
    ) -> Self {
        Self {
            membership,
            messages,
            receipts,
            publisher,
        }
    }

    /// Handle one envelope received on `origin`.
    ///
    /// Returns the number of publications made. Errors mean the event was
    /// dropped; only a failed save also notifies `origin`.
    #[instrument(skip_all, fields(event_type = %envelope.event_type, user_id = %origin.user_id))]
    pub async fn dispatch(
        &self,
        origin: &ClientConnection,
        envelope: Envelope,
    ) -> Result<usize, DispatchError> {
        let Some(kind) = envelope.kind() else {
            return Err(DispatchError::UnknownType(envelope.event_type));
        };
        let published = match kind {
            EventKind::NewMessage => self.on_new_message(origin, &envelope).await?,
            EventKind::Typing | EventKind::StopTyping => {
                self.on_typing(origin, kind, &envelope).await?
            }
            EventKind::MessageRead => self.on_read(origin, &envelope).await?,
            _ if kind.is_signaling() => self.on_signal(kind, envelope).await?,
            // online, offline and error are server-originated only
            _ => return Err(DispatchError::UnknownType(envelope.event_type)),
        };
        counter!(EVENTS_DISPATCHED_TOTAL, "type" => kind.as_str()).increment(1);
        debug!(published, "event dispatched");
        Ok(published)
    }

    async fn on_new_message(
        &self,
        origin: &ClientConnection,
        envelope: &Envelope,
    ) -> Result<usize, DispatchError> {
        let request: NewMessageRequest = parse(envelope, EventKind::NewMessage)?;
        let conversation_id = request.conversation_id.clone();
        let message = NewMessage {
            conversation_id: request.conversation_id,
            sender_id: origin.user_id.clone(),
            content: request.content,
            kind: request.kind.unwrap_or_default(),
            reply_to_id: request.reply_to_id,
            file_url: request.file_url,
            file_name: request.file_name,
            file_size: request.file_size,
        };

        let saved = match self.messages.save_message(message).await {
            Ok(saved) => saved,
            Err(e) => {
                reject(origin, &e);
                return Err(DispatchError::Persistence(e));
            }
        };

        let outbound = Envelope::new(EventKind::NewMessage, &saved).map_err(DispatchError::Encode)?;
        self.publish_to_members(&conversation_id, &origin.user_id, &outbound)
            .await
    }

    async fn on_typing(
        &self,
        origin: &ClientConnection,
        kind: EventKind,
        envelope: &Envelope,
    ) -> Result<usize, DispatchError> {
        let request: TypingRequest = parse(envelope, kind)?;
        let payload = TypingPayload {
            conversation_id: request.conversation_id.clone(),
            user_id: origin.user_id.clone(),
            name: origin.display_name.clone(),
        };
        let outbound = Envelope::new(kind, payload).map_err(DispatchError::Encode)?;
        self.publish_to_members(&request.conversation_id, &origin.user_id, &outbound)
            .await
    }

    async fn on_read(
        &self,
        origin: &ClientConnection,
        envelope: &Envelope,
    ) -> Result<usize, DispatchError> {
        let request: ReadRequest = parse(envelope, EventKind::MessageRead)?;
        self.receipts
            .mark_read(&request.conversation_id, &origin.user_id)
            .await
            .map_err(DispatchError::ReadTracking)?;
        let payload = ReadPayload {
            conversation_id: request.conversation_id.clone(),
            message_id: request.message_id,
            user_id: origin.user_id.clone(),
        };
        let outbound = Envelope::new(EventKind::MessageRead, payload).map_err(DispatchError::Encode)?;
        self.publish_to_members(&request.conversation_id, &origin.user_id, &outbound)
            .await
    }

    /// Forward a signaling envelope, unchanged, to `payload.to` only.
    async fn on_signal(&self, kind: EventKind, envelope: Envelope) -> Result<usize, DispatchError> {
        let request: SignalRequest = parse(&envelope, kind)?;
        let published = self.publisher.publish(Some(request.to), envelope).await;
        Ok(usize::from(published))
    }

    async fn publish_to_members(
        &self,
        conversation_id: &ConversationId,
        sender: &UserId,
        event: &Envelope,
    ) -> Result<usize, DispatchError> {
        let members = self
            .membership
            .member_ids(conversation_id)
            .await
            .map_err(|source| DispatchError::Membership {
                conversation_id: conversation_id.clone(),
                source,
            })?;

        let mut published = 0;
        for member in members.into_iter().filter(|m| m != sender) {
            if self.publisher.publish(Some(member), event.clone()).await {
                published += 1;
            }
        }
        Ok(published)
    }
}

fn parse<T: DeserializeOwned>(envelope: &Envelope, kind: EventKind) -> Result<T, DispatchError> {
    envelope
        .payload_as()
        .map_err(|source| DispatchError::InvalidPayload {
            event_type: kind.as_str(),
            source,
        })
}

/// Send an error reply straight to the sender's queue, bypassing the bus.
fn reject(origin: &ClientConnection, error: &StoreError) {
    let payload = ErrorPayload {
        code: MESSAGE_REJECTED.to_owned(),
        message: error.to_string(),
    };
    let outcome = Envelope::new(EventKind::Error, payload)
        .and_then(|reply| origin.send_envelope(&reply));
    match outcome {
        Ok(Enqueue::Queued) => {}
        Ok(other) => warn!(conn_id = %origin.id, ?other, "error reply not queued"),
        Err(e) => warn!(conn_id = %origin.id, error = %e, "failed to encode error reply"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusMessage, BusStream, MessageBus};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use talkie_core::{BusError, Identity, InMemoryDirectory, LookupError};
    use tokio::sync::mpsc;

    /// Records every publication instead of delivering it.
    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<BusMessage>>,
    }

    impl RecordingBus {
        fn targets(&self) -> Vec<Option<String>> {
            self.published
                .lock()
                .iter()
                .map(|m| m.target_user_id.as_ref().map(ToString::to_string))
                .collect()
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn publish(&self, message: &BusMessage) -> Result<(), BusError> {
            self.published.lock().push(message.clone());
            Ok(())
        }

        async fn subscribe(&self) -> Result<BusStream, BusError> {
            Err(BusError::Subscribe("recording bus has no subscribers".into()))
        }
    }

    struct Fixture {
        dispatcher: EventDispatcher,
        bus: Arc<RecordingBus>,
        directory: Arc<InMemoryDirectory>,
        origin: Arc<ClientConnection>,
        origin_rx: mpsc::Receiver<Arc<str>>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        directory.add_conversation("c1", ["A", "B", "C"]);
        let bus = Arc::new(RecordingBus::default());
        let dispatcher = EventDispatcher::new(
            directory.clone(),
            directory.clone(),
            directory.clone(),
            Publisher::new(bus.clone()),
        );
        let (origin, origin_rx) = ClientConnection::new(
            Identity {
                user_id: "A".into(),
                display_name: "Alice".into(),
            },
            8,
        );
        Fixture {
            dispatcher,
            bus,
            directory,
            origin,
            origin_rx,
        }
    }

    fn envelope(raw: serde_json::Value) -> Envelope {
        serde_json::from_value(raw).unwrap()
    }

    #[tokio::test]
    async fn typing_goes_to_members_except_sender() {
        let fx = fixture();
        let published = fx
            .dispatcher
            .dispatch(
                &fx.origin,
                envelope(json!({"type": "typing", "payload": {"conversation_id": "c1"}})),
            )
            .await
            .unwrap();

        assert_eq!(published, 2);
        assert_eq!(
            fx.bus.targets(),
            vec![Some("B".to_string()), Some("C".to_string())]
        );
        let event = &fx.bus.published.lock()[0].event;
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({"type": "typing", "payload": {"conversation_id": "c1", "user_id": "A", "name": "Alice"}})
        );
    }

    #[tokio::test]
    async fn stop_typing_keeps_its_type() {
        let fx = fixture();
        let _ = fx
            .dispatcher
            .dispatch(
                &fx.origin,
                envelope(json!({"type": "stop_typing", "payload": {"conversation_id": "c1"}})),
            )
            .await
            .unwrap();
        let published = fx.bus.published.lock();
        assert!(published.iter().all(|m| m.event.event_type == "stop_typing"));
    }

    #[tokio::test]
    async fn new_message_is_saved_then_published_to_others() {
        let fx = fixture();
        let published = fx
            .dispatcher
            .dispatch(
                &fx.origin,
                envelope(json!({"type": "new_message", "payload": {"conversation_id": "c1", "content": "hi", "type": "text"}})),
            )
            .await
            .unwrap();

        assert_eq!(published, 2);
        let saved = fx.directory.messages();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].sender_id.as_str(), "A");

        let event = fx.bus.published.lock()[0].event.clone();
        assert_eq!(event.kind(), Some(EventKind::NewMessage));
        assert_eq!(event.payload["id"], saved[0].id.as_str());
        assert_eq!(event.payload["content"], "hi");
        assert_eq!(event.payload["status"], "sent");
        assert!(!fx.bus.targets().contains(&Some("A".to_string())));
    }

    #[tokio::test]
    async fn failed_save_replies_to_sender_only() {
        let mut fx = fixture();
        fx.directory.add_conversation("c2", ["B"]);
        let err = fx
            .dispatcher
            .dispatch(
                &fx.origin,
                envelope(json!({"type": "new_message", "payload": {"conversation_id": "c2", "content": "x"}})),
            )
            .await
            .unwrap_err();

        assert_matches!(err, DispatchError::Persistence(StoreError::Rejected(_)));
        assert!(fx.bus.published.lock().is_empty());

        let frame = fx.origin_rx.try_recv().unwrap();
        let reply = Envelope::decode(&frame).unwrap();
        assert_eq!(reply.kind(), Some(EventKind::Error));
        assert_eq!(reply.payload["code"], MESSAGE_REJECTED);
        assert!(reply.payload["message"].is_string());
    }

    #[tokio::test]
    async fn read_receipt_marks_then_notifies() {
        let fx = fixture();
        let published = fx
            .dispatcher
            .dispatch(
                &fx.origin,
                envelope(json!({"type": "message_read", "payload": {"conversation_id": "c1", "message_id": "m9"}})),
            )
            .await
            .unwrap();

        assert_eq!(published, 2);
        assert_eq!(fx.directory.reads().len(), 1);
        let event = fx.bus.published.lock()[0].event.clone();
        assert_eq!(
            event.payload,
            json!({"conversation_id": "c1", "message_id": "m9", "user_id": "A"})
        );
    }

    #[tokio::test]
    async fn read_tracking_failure_drops_notification() {
        let fx = fixture();
        fx.directory.add_conversation("c3", ["B"]);
        let err = fx
            .dispatcher
            .dispatch(
                &fx.origin,
                envelope(json!({"type": "message_read", "payload": {"conversation_id": "c3"}})),
            )
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::ReadTracking(_));
        assert!(fx.bus.published.lock().is_empty());
    }

    #[tokio::test]
    async fn signaling_is_forwarded_verbatim_to_target_only() {
        let fx = fixture();
        let raw = json!({"type": "call_offer", "payload": {"to": "B", "sdp": "v=0", "conversation_id": "c1"}});
        let published = fx
            .dispatcher
            .dispatch(&fx.origin, envelope(raw.clone()))
            .await
            .unwrap();

        assert_eq!(published, 1);
        assert_eq!(fx.bus.targets(), vec![Some("B".to_string())]);
        let event = &fx.bus.published.lock()[0].event;
        assert_eq!(serde_json::to_value(event).unwrap(), raw);
    }

    #[tokio::test]
    async fn every_signaling_kind_is_routed() {
        let fx = fixture();
        for ty in ["call_offer", "call_answer", "call_ice_candidate", "call_hangup"] {
            let published = fx
                .dispatcher
                .dispatch(&fx.origin, envelope(json!({"type": ty, "payload": {"to": "C"}})))
                .await
                .unwrap();
            assert_eq!(published, 1, "{ty}");
        }
        assert_eq!(fx.bus.published.lock().len(), 4);
    }

    #[tokio::test]
    async fn unknown_and_server_only_types_are_rejected() {
        let fx = fixture();
        for ty in ["dance", "online", "offline", "error"] {
            let err = fx
                .dispatcher
                .dispatch(&fx.origin, envelope(json!({"type": ty, "payload": {}})))
                .await
                .unwrap_err();
            assert_matches!(err, DispatchError::UnknownType(t) if t == ty);
        }
        assert!(fx.bus.published.lock().is_empty());
    }

    #[tokio::test]
    async fn missing_required_field_is_invalid_payload() {
        let fx = fixture();
        let err = fx
            .dispatcher
            .dispatch(&fx.origin, envelope(json!({"type": "call_answer", "payload": {"sdp": "x"}})))
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::InvalidPayload { event_type: "call_answer", .. });

        let err = fx
            .dispatcher
            .dispatch(&fx.origin, envelope(json!({"type": "typing", "payload": {}})))
            .await
            .unwrap_err();
        assert_matches!(err, DispatchError::InvalidPayload { event_type: "typing", .. });
    }

    #[tokio::test]
    async fn unknown_conversation_is_membership_error() {
        let fx = fixture();
        let err = fx
            .dispatcher
            .dispatch(
                &fx.origin,
                envelope(json!({"type": "typing", "payload": {"conversation_id": "nope"}})),
            )
            .await
            .unwrap_err();
        assert_matches!(
            err,
            DispatchError::Membership { source: LookupError::NotFound(_), .. }
        );
        assert!(fx.bus.published.lock().is_empty());
    }
}
