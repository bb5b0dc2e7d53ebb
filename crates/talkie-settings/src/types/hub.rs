//! Registry and connection pump tuning.

use serde::{Deserialize, Serialize};

/// Connection registry and pump settings.
///
/// The ping period is not configured directly; it is derived as nine tenths
/// of `pong_wait_ms` so a ping always lands before the read deadline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Read deadline after the last pong, in milliseconds.
    pub pong_wait_ms: u64,
    /// Deadline for a single outbound write, in milliseconds.
    pub write_wait_ms: u64,
    /// Largest accepted inbound frame, in bytes.
    pub max_frame_bytes: usize,
    /// Join already-queued events into one newline-delimited frame.
    pub coalesce_writes: bool,
    /// Capacity of the connect/disconnect control queue.
    pub control_queue_capacity: usize,
    /// Capacity of the presence transition channel.
    pub presence_channel_capacity: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            pong_wait_ms: 60_000,
            write_wait_ms: 10_000,
            max_frame_bytes: 4096,
            coalesce_writes: true,
            control_queue_capacity: 1024,
            presence_channel_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let hub = HubSettings::default();
        assert_eq!(hub.queue_capacity, 256);
        assert_eq!(hub.pong_wait_ms, 60_000);
        assert_eq!(hub.write_wait_ms, 10_000);
        assert_eq!(hub.max_frame_bytes, 4096);
        assert!(hub.coalesce_writes);
    }

    #[test]
    fn camel_case_fields() {
        let hub: HubSettings =
            serde_json::from_str(r#"{"queueCapacity": 8, "coalesceWrites": false}"#).unwrap();
        assert_eq!(hub.queue_capacity, 8);
        assert!(!hub.coalesce_writes);
        assert_eq!(hub.pong_wait_ms, 60_000);
    }
}
