//! Error hierarchy for the hub.
//!
//! Every variant here is absorbed locally (logged and counted) except
//! [`DispatchError::Persistence`], which is also reported back to the sending
//! connection.

use thiserror::Error;

use crate::ids::ConversationId;
use crate::traits::{LookupError, StoreError};

/// Registry control-path errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    /// The control loop has exited (shutdown in progress).
    #[error("hub control loop has stopped")]
    Stopped,
}

/// Pub/sub bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// Publishing failed (bus unreachable, connection dropped).
    #[error("bus publish failed: {0}")]
    Publish(String),
    /// Opening or reading the subscription failed.
    #[error("bus subscribe failed: {0}")]
    Subscribe(String),
    /// A bus payload could not be encoded or decoded.
    #[error("bus codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Reasons an inbound envelope produced no delivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The envelope type is not one the hub handles.
    #[error("unknown event type: {0}")]
    UnknownType(String),
    /// A required payload field was missing or malformed.
    #[error("invalid {event_type} payload: {source}")]
    InvalidPayload {
        /// Event type whose payload failed to parse.
        event_type: &'static str,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
    /// The membership lookup failed.
    #[error("membership lookup for {conversation_id} failed: {source}")]
    Membership {
        /// Conversation being resolved.
        conversation_id: ConversationId,
        /// Underlying lookup error.
        #[source]
        source: LookupError,
    },
    /// Saving the message failed; nothing was published.
    #[error("message persistence failed: {0}")]
    Persistence(#[source] StoreError),
    /// Recording the read receipt failed; nothing was published.
    #[error("read tracking failed: {0}")]
    ReadTracking(#[source] StoreError),
    /// An outbound envelope could not be built.
    #[error("failed to encode outbound event: {0}")]
    Encode(#[source] serde_json::Error),
}

impl DispatchError {
    /// Short label for metrics and log fields.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::UnknownType(_) => "unknown_type",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::Membership { .. } => "membership",
            Self::Persistence(_) => "persistence",
            Self::ReadTracking(_) => "read_tracking",
            Self::Encode(_) => "encode",
        }
    }
}

/// Identity verification errors at connection upgrade.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied.
    #[error("token required")]
    MissingToken,
    /// The token failed validation.
    #[error("invalid token: {0}")]
    InvalidToken(String),
}
