//! Wire envelope `{"type", "payload"}` and the typed payloads carried inside it.
//!
//! The same envelope shape travels in both directions. Inbound payloads are
//! parsed into the `*Request` structs (unknown fields ignored, missing required
//! fields rejected). Outbound payloads are built from the remaining structs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{ConversationId, MessageId, UserId};
use crate::message::MessageKind;

/// Known event types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A chat message (inbound request or outbound persisted message).
    NewMessage,
    /// Sender started typing in a conversation.
    Typing,
    /// Sender stopped typing.
    StopTyping,
    /// Sender read a conversation up to a message.
    MessageRead,
    /// Call signaling: offer.
    CallOffer,
    /// Call signaling: answer.
    CallAnswer,
    /// Call signaling: ICE candidate.
    CallIceCandidate,
    /// Call signaling: hangup.
    CallHangup,
    /// Presence: a user's first connection opened.
    Online,
    /// Presence: a user's last connection closed.
    Offline,
    /// Error reply addressed to a single connection.
    Error,
}

impl EventKind {
    /// Wire name of the event type.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewMessage => "new_message",
            Self::Typing => "typing",
            Self::StopTyping => "stop_typing",
            Self::MessageRead => "message_read",
            Self::CallOffer => "call_offer",
            Self::CallAnswer => "call_answer",
            Self::CallIceCandidate => "call_ice_candidate",
            Self::CallHangup => "call_hangup",
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Error => "error",
        }
    }

    /// Parse a wire name. Returns `None` for unrecognized types.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "new_message" => Self::NewMessage,
            "typing" => Self::Typing,
            "stop_typing" => Self::StopTyping,
            "message_read" => Self::MessageRead,
            "call_offer" => Self::CallOffer,
            "call_answer" => Self::CallAnswer,
            "call_ice_candidate" => Self::CallIceCandidate,
            "call_hangup" => Self::CallHangup,
            "online" => Self::Online,
            "offline" => Self::Offline,
            "error" => Self::Error,
            _ => return None,
        })
    }

    /// Point-to-point signaling events, forwarded verbatim to `payload.to`.
    pub const fn is_signaling(self) -> bool {
        matches!(
            self,
            Self::CallOffer | Self::CallAnswer | Self::CallIceCandidate | Self::CallHangup
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The `{type, payload}` frame exchanged over a connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event type name. Kept as a string so unknown types still decode.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Type-specific body.
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope of a known kind from a serializable payload.
    pub fn new(kind: EventKind, payload: impl Serialize) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: kind.as_str().to_owned(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode one inbound text frame.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Serialize to a single-line JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// The recognized kind, if any.
    pub fn kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event_type)
    }

    /// Parse the payload into a typed request.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

// ── Inbound payloads ────────────────────────────────────────────────────────

/// `new_message` request body.
#[derive(Clone, Debug, Deserialize)]
pub struct NewMessageRequest {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Text content (may be empty for attachments).
    #[serde(default)]
    pub content: String,
    /// Content kind; defaults to text.
    #[serde(default, rename = "type")]
    pub kind: Option<MessageKind>,
    /// Message being replied to.
    #[serde(default)]
    pub reply_to_id: Option<MessageId>,
    /// Uploaded file URL.
    #[serde(default)]
    pub file_url: Option<String>,
    /// Uploaded file name.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Uploaded file size in bytes.
    #[serde(default)]
    pub file_size: Option<i64>,
}

/// `typing` / `stop_typing` request body.
#[derive(Clone, Debug, Deserialize)]
pub struct TypingRequest {
    /// Conversation the sender is typing in.
    pub conversation_id: ConversationId,
}

/// `message_read` request body.
#[derive(Clone, Debug, Deserialize)]
pub struct ReadRequest {
    /// Conversation that was read.
    pub conversation_id: ConversationId,
    /// Last message seen, when the client reports it.
    #[serde(default)]
    pub message_id: Option<MessageId>,
}

/// Minimal view of a signaling payload: only the addressee is required.
#[derive(Clone, Debug, Deserialize)]
pub struct SignalRequest {
    /// Target user.
    pub to: UserId,
}

// ── Outbound payloads ───────────────────────────────────────────────────────

/// `online` / `offline` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresencePayload {
    /// User whose presence changed.
    pub user_id: UserId,
    /// New presence.
    pub is_online: bool,
}

/// Outbound `typing` / `stop_typing` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    /// Conversation being typed in.
    pub conversation_id: ConversationId,
    /// Who is typing.
    pub user_id: UserId,
    /// Display name of the typist.
    pub name: String,
}

/// Outbound `message_read` body.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPayload {
    /// Conversation that was read.
    pub conversation_id: ConversationId,
    /// Last message seen, if reported.
    pub message_id: Option<MessageId>,
    /// Reader.
    pub user_id: UserId,
}

/// Outbound `error` body, sent to a single connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}
