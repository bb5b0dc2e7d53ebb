//! `/health` and `/online` response bodies.

use serde::Serialize;
use std::time::Instant;

use talkie_core::UserId;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"shutting_down"` once shutdown has begun.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Open connections on this process.
    pub connections: usize,
    /// Users with at least one connection on this process.
    pub online_users: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    shutting_down: bool,
    connections: usize,
    online_users: usize,
) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "shutting_down" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        online_users,
    }
}

/// `/online` response body.
#[derive(Debug, Clone, Serialize)]
pub struct OnlineResponse {
    /// Users online on this process, sorted.
    pub user_ids: Vec<UserId>,
}
