//! Phased shutdown.
//!
//! The hub stops in a fixed order, one [`CancellationToken`] per phase:
//!
//! 1. [`Phase::Intake`]: the HTTP listener stops accepting and the registry
//!    control loop disconnects every connection, queueing one `offline`
//!    transition per online user.
//! 2. [`Phase::Presence`]: the presence consumers drain those transitions
//!    into the observer and the bus, then exit.
//! 3. [`Phase::Bus`]: the bus subscription closes.
//!
//! A phase's token is cancelled only after every task of the previous phase
//! has finished.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default timeout for graceful shutdown before giving up on stragglers.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A shutdown step. Phases stop in declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// HTTP listener and registry control loop.
    Intake,
    /// Presence announcer and observer forwarder.
    Presence,
    /// Bus subscription.
    Bus,
}

impl Phase {
    /// Every phase, in stopping order.
    pub const ORDER: [Self; 3] = [Self::Intake, Self::Presence, Self::Bus];

    /// Label for logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Presence => "presence",
            Self::Bus => "bus",
        }
    }
}

/// Owns the per-phase tokens and the background tasks stopped by each.
pub struct ShutdownCoordinator {
    intake: CancellationToken,
    presence: CancellationToken,
    bus: CancellationToken,
    tasks: Mutex<Vec<(Phase, JoinHandle<()>)>>,
}

impl ShutdownCoordinator {
    /// Create a coordinator with no tracked tasks.
    pub fn new() -> Self {
        Self {
            intake: CancellationToken::new(),
            presence: CancellationToken::new(),
            bus: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Token cancelled when `phase` begins stopping.
    pub fn token(&self, phase: Phase) -> CancellationToken {
        match phase {
            Phase::Intake => self.intake.clone(),
            Phase::Presence => self.presence.clone(),
            Phase::Bus => self.bus.clone(),
        }
    }

    /// Stop `handle` as part of `phase`.
    pub fn track(&self, phase: Phase, handle: JoinHandle<()>) {
        self.tasks.lock().push((phase, handle));
    }

    /// Begin shutdown: stop intake without waiting for anything.
    ///
    /// Later phases are left running until [`Self::graceful_shutdown`].
    pub fn shutdown(&self) {
        self.intake.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.intake.is_cancelled()
    }

    /// Stop each phase in order, waiting for its tasks before cancelling the
    /// next. `timeout` bounds the whole sequence; once it passes, every
    /// remaining phase is cancelled without waiting.
    pub async fn graceful_shutdown(&self, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let mut pending = std::mem::take(&mut *self.tasks.lock());
        info!(
            task_count = pending.len(),
            timeout_secs = timeout.as_secs(),
            "stopping hub"
        );

        for phase in Phase::ORDER {
            let (current, rest): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(owner, _)| *owner == phase);
            pending = rest;

            self.token(phase).cancel();
            debug!(phase = phase.as_str(), task_count = current.len(), "phase stopping");
            let handles = current.into_iter().map(|(_, handle)| handle);
            if timeout_at(deadline, futures::future::join_all(handles))
                .await
                .is_err()
            {
                warn!(
                    phase = phase.as_str(),
                    "shutdown timed out after {timeout:?}, cancelling remaining phases"
                );
                for later in Phase::ORDER {
                    self.token(later).cancel();
                }
                return;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
