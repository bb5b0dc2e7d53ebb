//! Heartbeat timing: ping period and the pong-refreshed read deadline.

use std::time::Duration;

use tokio::time::Instant;

/// Ping period for a read-deadline window: nine tenths of `pong_wait`, so at
/// least one ping lands before the deadline can fire.
pub fn ping_period(pong_wait: Duration) -> Duration {
    pong_wait * 9 / 10
}

/// Read deadline for the inbound pump.
///
/// Starts one window after creation and moves forward only on
/// [`ReadDeadline::refresh`], which the pump calls for every pong.
#[derive(Debug)]
pub struct ReadDeadline {
    window: Duration,
    at: Instant,
}

impl ReadDeadline {
    /// Start a deadline `window` from now.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            at: Instant::now() + window,
        }
    }

    /// Push the deadline one full window past now.
    pub fn refresh(&mut self) {
        self.at = Instant::now() + self.window;
    }

    /// The instant the read times out.
    pub fn at(&self) -> Instant {
        self.at
    }
}
