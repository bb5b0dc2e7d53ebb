//! Per-connection state shared between the registry and the pumps.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use talkie_core::{ConnectionId, Envelope, Identity, UserId};

/// Lifecycle of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, both directions running.
    Active,
    /// Teardown started (read/write failure, timeout, overflow or peer close).
    Closing,
    /// Both directions torn down and removed from the registry.
    Closed,
}

impl ConnectionState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Active,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Outcome of enqueuing a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueue {
    /// The frame is queued for the writer.
    Queued,
    /// The queue was full. The queue is now closed and the connection is
    /// doomed; the caller should detach it from the registry.
    Full,
    /// The queue was already closed.
    Closed,
}

/// A connected client: identity, bounded outbound queue and lifecycle state.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Owning user.
    pub user_id: UserId,
    /// Owning user's display name.
    pub display_name: String,
    /// When the connection was established.
    pub connected_at: Instant,
    /// Sender side of the outbound queue; `None` once closed.
    tx: Mutex<Option<mpsc::Sender<Arc<str>>>>,
    state: AtomicU8,
    dropped_frames: AtomicU64,
}

impl ClientConnection {
    /// Create a connection with an outbound queue of `capacity` frames.
    ///
    /// Returns the receiving end for the writer pump.
    pub fn new(identity: Identity, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Self {
            id: ConnectionId::new(),
            user_id: identity.user_id,
            display_name: identity.display_name,
            connected_at: Instant::now(),
            tx: Mutex::new(Some(tx)),
            state: AtomicU8::new(ConnectionState::Active as u8),
            dropped_frames: AtomicU64::new(0),
        };
        (Arc::new(conn), rx)
    }

    /// Enqueue a serialized frame without blocking.
    ///
    /// A full queue closes the queue: the writer drains what is already
    /// queued, then ends the connection.
    pub fn send(&self, frame: Arc<str>) -> Enqueue {
        let mut tx = self.tx.lock();
        let Some(sender) = tx.as_ref() else {
            return Enqueue::Closed;
        };
        match sender.try_send(frame) {
            Ok(()) => Enqueue::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
                *tx = None;
                drop(tx);
                self.begin_closing();
                Enqueue::Full
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                *tx = None;
                Enqueue::Closed
            }
        }
    }

    /// Serialize an envelope and enqueue it.
    pub fn send_envelope(&self, envelope: &Envelope) -> Result<Enqueue, serde_json::Error> {
        let json = envelope.to_json()?;
        Ok(self.send(Arc::from(json)))
    }

    /// Close the outbound queue. Returns `false` if it was already closed.
    pub fn close_queue(&self) -> bool {
        let was_open = self.tx.lock().take().is_some();
        if was_open {
            self.begin_closing();
        }
        was_open
    }

    /// Whether the outbound queue still accepts frames.
    pub fn is_open(&self) -> bool {
        self.tx.lock().is_some()
    }

    /// Move `Active` to `Closing`. No effect in any other state.
    pub fn begin_closing(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Active as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Mark both directions as torn down.
    pub fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Frames rejected because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
