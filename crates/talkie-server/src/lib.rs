//! # talkie-server
//!
//! Real-time connection hub: Axum `WebSocket` gateway, connection registry,
//! per-connection pumps, event dispatch and cross-process fan-out.
//!
//! - Registry: user → connections table, serialized connect/disconnect, presence transitions
//! - Pumps: one reader and one writer task per connection, heartbeat and write deadlines
//! - Dispatcher: routes inbound envelopes to recipients via collaborator traits
//! - Bus: publish/subscribe fan-out (in-process or Redis) bridged into the registry
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod auth;
pub mod bus;
pub mod config;
pub mod health;
pub mod metrics;
pub mod presence;
pub mod server;
pub mod shutdown;
pub mod websocket;
