//! Chat message model as exchanged with the message store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, UserId};

/// Kind of content a message carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image attachment.
    Image,
    /// Generic file attachment.
    File,
}

/// Delivery status of a persisted message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Accepted by the server.
    #[default]
    Sent,
    /// Delivered to at least one recipient device.
    Delivered,
    /// Read by a recipient.
    Read,
}

/// A message to persist, as received from the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewMessage {
    /// Target conversation.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Text content.
    pub content: String,
    /// Content kind.
    pub kind: MessageKind,
    /// Message being replied to.
    pub reply_to_id: Option<MessageId>,
    /// Attachment URL.
    pub file_url: Option<String>,
    /// Attachment name.
    pub file_name: Option<String>,
    /// Attachment size in bytes.
    pub file_size: Option<i64>,
}

/// A fully populated message returned by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Store-assigned ID.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Author.
    pub sender_id: UserId,
    /// Text content.
    pub content: String,
    /// Content kind.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Delivery status.
    pub status: MessageStatus,
    /// Attachment URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Attachment name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Attachment size in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
    /// Message being replied to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<MessageId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}
