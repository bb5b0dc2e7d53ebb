//! Connection registry, per-connection pumps, heartbeat timing and event dispatch.

pub mod connection;
pub mod dispatcher;
pub mod heartbeat;
pub mod pump;
pub mod registry;
