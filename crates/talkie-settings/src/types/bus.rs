//! Fan-out bus settings.

use serde::{Deserialize, Serialize};

/// Which pub/sub backend carries events between hub processes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process broadcast; single-process deployments only.
    #[default]
    Local,
    /// Redis pub/sub; shared by every process pointed at the same server.
    Redis,
}

impl BusBackend {
    /// Parse a backend name (case-insensitive).
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "local" => Some(Self::Local),
            "redis" => Some(Self::Redis),
            _ => None,
        }
    }
}

/// Bus settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusSettings {
    /// Backend selection.
    pub backend: BusBackend,
    /// Redis connection URL (redis backend only).
    pub redis_url: String,
    /// Pub/sub channel name.
    pub channel: String,
    /// Wait before resubscribing after the subscription drops, in milliseconds.
    pub resubscribe_delay_ms: u64,
    /// Buffer size of the local backend.
    pub local_capacity: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            backend: BusBackend::Local,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            channel: "talkie:messages".to_string(),
            resubscribe_delay_ms: 1000,
            local_capacity: 4096,
        }
    }
}
