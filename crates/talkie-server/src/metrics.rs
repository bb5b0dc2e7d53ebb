//! Prometheus metrics recorder and metric names.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the handle used to render `/metrics`. Call once at startup before
/// any metric is recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Build a handle without installing it globally (tests, embedded use).
pub fn detached_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Connections opened (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections closed (counter, labels: reason).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Open connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Connection lifetime (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Users with at least one local connection (gauge).
pub const HUB_ONLINE_USERS: &str = "hub_online_users";
/// Connections dropped because their outbound queue was full (counter).
pub const HUB_QUEUE_OVERFLOW_TOTAL: &str = "hub_queue_overflow_total";
/// Frames enqueued to connections (counter).
pub const HUB_FRAMES_ENQUEUED_TOTAL: &str = "hub_frames_enqueued_total";
/// Inbound events handled (counter, labels: type).
pub const EVENTS_DISPATCHED_TOTAL: &str = "events_dispatched_total";
/// Inbound events dropped (counter, labels: reason).
pub const EVENTS_DROPPED_TOTAL: &str = "events_dropped_total";
/// Bus publish failures (counter).
pub const BUS_PUBLISH_FAILURES_TOTAL: &str = "bus_publish_failures_total";
/// Bus messages that could not be decoded or were skipped (counter).
pub const BUS_RECEIVE_ERRORS_TOTAL: &str = "bus_receive_errors_total";
/// Bus resubscribe attempts (counter).
pub const BUS_RESUBSCRIBES_TOTAL: &str = "bus_resubscribes_total";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_handle_renders() {
        let output = detached_handle().render();
        assert!(output.is_empty() || output.contains('#') || output.contains('\n'));
    }

    #[test]
    fn metric_names_are_snake_case() {
        let names = [
            WS_CONNECTIONS_TOTAL,
            WS_DISCONNECTIONS_TOTAL,
            WS_CONNECTIONS_ACTIVE,
            WS_CONNECTION_DURATION_SECONDS,
            HUB_ONLINE_USERS,
            HUB_QUEUE_OVERFLOW_TOTAL,
            HUB_FRAMES_ENQUEUED_TOTAL,
            EVENTS_DISPATCHED_TOTAL,
            EVENTS_DROPPED_TOTAL,
            BUS_PUBLISH_FAILURES_TOTAL,
            BUS_RECEIVE_ERRORS_TOTAL,
            BUS_RESUBSCRIBES_TOTAL,
        ];
        for name in names {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "{name}"
            );
        }
    }
}
