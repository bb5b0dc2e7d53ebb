//! Server configuration derived from settings.

use std::time::Duration;

use talkie_settings::{HubSettings, TalkieSettings};

use crate::websocket::heartbeat::ping_period;

/// Registry and pump tuning with durations resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HubConfig {
    /// Outbound queue capacity per connection.
    pub queue_capacity: usize,
    /// Read deadline window, refreshed on every pong.
    pub pong_wait: Duration,
    /// Interval between server pings (9/10 of `pong_wait`).
    pub ping_period: Duration,
    /// Deadline for a single outbound write.
    pub write_wait: Duration,
    /// Largest accepted inbound frame, in bytes.
    pub max_frame_bytes: usize,
    /// Join already-queued events into one newline-delimited frame.
    pub coalesce_writes: bool,
    /// Capacity of the connect/disconnect control queue.
    pub control_queue_capacity: usize,
    /// Capacity of the presence transition channel.
    pub presence_channel_capacity: usize,
}

impl HubConfig {
    /// Resolve hub settings into runtime configuration.
    pub fn from_settings(settings: &HubSettings) -> Self {
        let pong_wait = Duration::from_millis(settings.pong_wait_ms);
        Self {
            queue_capacity: settings.queue_capacity,
            pong_wait,
            ping_period: ping_period(pong_wait),
            write_wait: Duration::from_millis(settings.write_wait_ms),
            max_frame_bytes: settings.max_frame_bytes,
            coalesce_writes: settings.coalesce_writes,
            control_queue_capacity: settings.control_queue_capacity,
            presence_channel_capacity: settings.presence_channel_capacity,
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_settings(&HubSettings::default())
    }
}

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port (0 = auto-assign).
    pub port: u16,
    /// Registry and pump tuning.
    pub hub: HubConfig,
    /// Wait before resubscribing after the bus subscription drops.
    pub resubscribe_delay: Duration,
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &TalkieSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            hub: HubConfig::from_settings(&settings.hub),
            resubscribe_delay: Duration::from_millis(settings.bus.resubscribe_delay_ms),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            hub: HubConfig::default(),
            resubscribe_delay: Duration::from_secs(1),
        }
    }
}
