//! In-memory collaborator implementations for development runs and tests.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use thiserror::Error;

use crate::ids::{ConversationId, MessageId, UserId};
use crate::message::{ChatMessage, MessageStatus, NewMessage};
use crate::traits::{LookupError, MembershipLookup, MessageStore, PresenceObserver, ReadTracker, StoreError};

/// Errors loading a directory seed file.
#[derive(Debug, Error)]
pub enum SeedError {
    /// The file could not be read.
    #[error("failed to read seed file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not valid seed JSON.
    #[error("failed to parse seed file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Default, Deserialize)]
struct Seed {
    #[serde(default)]
    conversations: HashMap<ConversationId, Vec<UserId>>,
}

/// Conversations, messages, read receipts and presence history kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    conversations: RwLock<HashMap<ConversationId, Vec<UserId>>>,
    messages: Mutex<Vec<ChatMessage>>,
    reads: Mutex<Vec<(ConversationId, UserId)>>,
    presence: Mutex<Vec<(UserId, bool)>>,
}

impl InMemoryDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load conversations from a JSON seed file:
    /// `{"conversations": {"<id>": ["<user>", ...]}}`.
    pub fn from_seed_file(path: &Path) -> Result<Self, SeedError> {
        let content = std::fs::read_to_string(path)?;
        let seed: Seed = serde_json::from_str(&content)?;
        let directory = Self::new();
        *directory.conversations.write() = seed.conversations;
        Ok(directory)
    }

    /// Create or replace a conversation with the given members.
    pub fn add_conversation(
        &self,
        conversation_id: impl Into<ConversationId>,
        members: impl IntoIterator<Item = impl Into<UserId>>,
    ) {
        let members = members.into_iter().map(Into::into).collect();
        let _ = self.conversations.write().insert(conversation_id.into(), members);
    }

    /// Messages saved so far, oldest first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.lock().clone()
    }

    /// Read receipts recorded so far.
    pub fn reads(&self) -> Vec<(ConversationId, UserId)> {
        self.reads.lock().clone()
    }

    /// Presence transitions observed so far.
    pub fn presence_history(&self) -> Vec<(UserId, bool)> {
        self.presence.lock().clone()
    }

    fn is_member(&self, conversation_id: &ConversationId, user_id: &UserId) -> bool {
        self.conversations
            .read()
            .get(conversation_id)
            .is_some_and(|members| members.contains(user_id))
    }
}

#[async_trait]
impl MembershipLookup for InMemoryDirectory {
    async fn member_ids(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<UserId>, LookupError> {
        self.conversations
            .read()
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(conversation_id.clone()))
    }
}

#[async_trait]
impl MessageStore for InMemoryDirectory {
    async fn save_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        if !self.is_member(&message.conversation_id, &message.sender_id) {
            return Err(StoreError::Rejected(
                "you are not a member of this conversation".into(),
            ));
        }
        let saved = ChatMessage {
            id: MessageId::from_string(uuid::Uuid::now_v7().to_string()),
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            content: message.content,
            kind: message.kind,
            status: MessageStatus::Sent,
            file_url: message.file_url,
            file_name: message.file_name,
            file_size: message.file_size,
            reply_to_id: message.reply_to_id,
            created_at: Utc::now(),
        };
        self.messages.lock().push(saved.clone());
        Ok(saved)
    }
}

#[async_trait]
impl ReadTracker for InMemoryDirectory {
    async fn mark_read(
        &self,
        conversation_id: &ConversationId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        if !self.is_member(conversation_id, user_id) {
            return Err(StoreError::Rejected(format!(
                "{user_id} is not a member of {conversation_id}"
            )));
        }
        self.reads
            .lock()
            .push((conversation_id.clone(), user_id.clone()));
        Ok(())
    }
}

#[async_trait]
impl PresenceObserver for InMemoryDirectory {
    async fn on_presence_changed(
        &self,
        user_id: &UserId,
        is_online: bool,
    ) -> Result<(), StoreError> {
        self.presence.lock().push((user_id.clone(), is_online));
        Ok(())
    }
}
