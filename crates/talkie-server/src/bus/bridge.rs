//! Bridge between the bus and the local registry.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use talkie_core::{Envelope, UserId};

use super::{BusMessage, BusStream, MessageBus};
use crate::metrics::{BUS_PUBLISH_FAILURES_TOTAL, BUS_RECEIVE_ERRORS_TOTAL, BUS_RESUBSCRIBES_TOTAL};
use crate::websocket::registry::Registry;

/// Best-effort publishing handle. The only path locally generated events take
/// to reach any connection, this process's included.
#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn MessageBus>,
}

impl Publisher {
    /// Wrap a bus.
    pub fn new(bus: Arc<dyn MessageBus>) -> Self {
        Self { bus }
    }

    /// Publish `event` to `target` (or to everyone when `None`).
    ///
    /// Failures are logged and counted; the event is dropped for every
    /// process. Returns whether the bus accepted it.
    pub async fn publish(&self, target: Option<UserId>, event: Envelope) -> bool {
        let message = match target {
            Some(user_id) => BusMessage::to_user(user_id, event),
            None => BusMessage::broadcast(event),
        };
        match self.bus.publish(&message).await {
            Ok(()) => true,
            Err(e) => {
                counter!(BUS_PUBLISH_FAILURES_TOTAL).increment(1);
                warn!(
                    bus = self.bus.name(),
                    event_type = %message.event.event_type,
                    error = %e,
                    "bus publish failed, dropping event"
                );
                false
            }
        }
    }
}

/// Runs the per-process bus subscription, delivering into the registry.
pub struct BusBridge {
    bus: Arc<dyn MessageBus>,
    registry: Arc<Registry>,
    resubscribe_delay: Duration,
}

impl BusBridge {
    /// Create a bridge.
    pub fn new(bus: Arc<dyn MessageBus>, registry: Arc<Registry>, resubscribe_delay: Duration) -> Self {
        Self {
            bus,
            registry,
            resubscribe_delay,
        }
    }

    /// Open the first subscription, then spawn the receive loop.
    ///
    /// Subscribing before returning means anything published after `start`
    /// resolves is seen by this process.
    pub async fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        let initial = match self.bus.subscribe().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(bus = self.bus.name(), error = %e, "initial bus subscribe failed, will retry");
                None
            }
        };
        tokio::spawn(self.run(initial, cancel))
    }

    #[instrument(skip_all, fields(bus = self.bus.name()))]
    async fn run(self, mut stream: Option<BusStream>, cancel: CancellationToken) {
        loop {
            if let Some(active) = stream.take() {
                info!("bus subscription active");
                if self.pump(active, &cancel).await {
                    break;
                }
                warn!("bus subscription ended");
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.resubscribe_delay) => {}
            }

            counter!(BUS_RESUBSCRIBES_TOTAL).increment(1);
            match self.bus.subscribe().await {
                Ok(next) => stream = Some(next),
                Err(e) => warn!(error = %e, "bus resubscribe failed"),
            }
        }
        info!("bus subscription stopped");
    }

    /// Deliver until the stream ends (returns `false`) or shutdown (`true`).
    async fn pump(&self, mut stream: BusStream, cancel: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return true,
                item = stream.next() => match item {
                    Some(Ok(message)) => self.route(message).await,
                    Some(Err(e)) => {
                        counter!(BUS_RECEIVE_ERRORS_TOTAL).increment(1);
                        warn!(error = %e, "skipping undecodable bus message");
                    }
                    None => return false,
                },
            }
        }
    }

    async fn route(&self, message: BusMessage) {
        let delivered = match &message.target_user_id {
            Some(user_id) => self.registry.deliver_to_user(user_id, &message.event).await,
            None => self.registry.deliver_broadcast(&message.event).await,
        };
        debug!(
            event_type = %message.event.event_type,
            target = ?message.target_user_id,
            delivered,
            "bus message routed"
        );
    }
}
