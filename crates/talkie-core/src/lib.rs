//! # talkie-core
//!
//! Shared vocabulary for the Talkie real-time hub.
//!
//! - **Branded IDs**: `UserId`, `ConversationId`, `MessageId`, `ConnectionId`
//! - **Envelope**: the `{type, payload}` wire frame and its typed payloads
//! - **Messages**: `ChatMessage` as returned by the message store
//! - **Errors**: `HubError`, `BusError`, `DispatchError`, `AuthError` via `thiserror`
//! - **Collaborators**: membership, storage, read-tracking, presence and identity traits
//! - **In-memory collaborators**: `InMemoryDirectory` for local runs and tests

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod memory;
pub mod message;
pub mod traits;

pub use envelope::{Envelope, EventKind};
pub use errors::{AuthError, BusError, DispatchError, HubError};
pub use ids::{ConnectionId, ConversationId, MessageId, UserId};
pub use memory::InMemoryDirectory;
pub use message::{ChatMessage, MessageKind, MessageStatus, NewMessage};
pub use traits::{
    Identity, IdentityVerifier, LookupError, MembershipLookup, MessageStore, PresenceObserver,
    ReadTracker, StoreError,
};
