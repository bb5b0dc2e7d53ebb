//! Collaborator interfaces the hub depends on but does not implement.
//!
//! Storage, membership and identity live outside the hub. Production
//! deployments plug in database-backed implementations; tests and local runs
//! use [`crate::memory::InMemoryDirectory`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors::AuthError;
use crate::ids::{ConversationId, UserId};
use crate::message::{ChatMessage, NewMessage};

/// Membership lookup failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// The conversation does not exist.
    #[error("conversation {0} not found")]
    NotFound(ConversationId),
    /// The backing store could not answer.
    #[error("membership store unavailable: {0}")]
    Unavailable(String),
}

/// Storage side-effect failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store refused the operation (e.g. sender is not a member).
    #[error("rejected: {0}")]
    Rejected(String),
    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A verified identity attached to a connection at upgrade time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Authenticated user.
    pub user_id: UserId,
    /// Display name shown to other users.
    pub display_name: String,
}

/// Resolves which users belong to a conversation.
#[async_trait]
pub trait MembershipLookup: Send + Sync {
    /// All member user IDs of `conversation_id`.
    async fn member_ids(&self, conversation_id: &ConversationId)
    -> Result<Vec<UserId>, LookupError>;
}

/// Persists chat messages before they are announced.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Save `message` and return the fully populated record.
    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;
}

/// Records read receipts.
#[async_trait]
pub trait ReadTracker: Send + Sync {
    /// Mark `conversation_id` as read by `user_id`.
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), StoreError>;
}

/// Receives presence transitions (e.g. to update last-seen timestamps).
///
/// Called at most once per transition. Errors are logged by the caller and
/// never reach the hub.
#[async_trait]
pub trait PresenceObserver: Send + Sync {
    /// `user_id` went online (`true`) or offline (`false`).
    async fn on_presence_changed(&self, user_id: &UserId, is_online: bool)
    -> Result<(), StoreError>;
}

/// Verifies the credential presented at connection upgrade.
pub trait IdentityVerifier: Send + Sync {
    /// Validate `token` and return the identity it carries.
    fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}
