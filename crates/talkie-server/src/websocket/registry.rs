//! Connection registry: the authoritative user → connections table.
//!
//! Structural changes (connect/disconnect) go through one serialized control
//! loop so presence transitions are computed exactly once, in order. Delivery
//! runs concurrently from the bus subscription under a read guard; a
//! connection whose queue is full is detached under the write guard.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use metrics::{counter, gauge};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use talkie_core::{ConnectionId, Envelope, HubError, UserId};

use super::connection::{ClientConnection, Enqueue};
use crate::config::HubConfig;
use crate::metrics::{HUB_FRAMES_ENQUEUED_TOTAL, HUB_ONLINE_USERS, HUB_QUEUE_OVERFLOW_TOTAL};

type ConnectionSet = HashMap<ConnectionId, Arc<ClientConnection>>;
type Table = HashMap<UserId, ConnectionSet>;

/// A user's presence flipped on this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceChange {
    /// User whose presence changed.
    pub user_id: UserId,
    /// `true` on the first connection, `false` when the last one closes.
    pub is_online: bool,
}

enum Control {
    Connect {
        conn: Arc<ClientConnection>,
        ack: oneshot::Sender<()>,
    },
    Disconnect {
        user_id: UserId,
        conn_id: ConnectionId,
        ack: oneshot::Sender<()>,
    },
}

/// Receiving end of the registry control queue, consumed by [`Registry::run`].
pub struct ControlReceiver(mpsc::Receiver<Control>);

/// The connection table plus its control path and presence channel.
pub struct Registry {
    table: RwLock<Table>,
    control_tx: mpsc::Sender<Control>,
    presence_tx: broadcast::Sender<PresenceChange>,
    connections: AtomicUsize,
}

impl Registry {
    /// Create a registry. The returned receiver must be handed to
    /// [`Registry::run`], which processes connects and disconnects.
    pub fn new(config: &HubConfig) -> (Arc<Self>, ControlReceiver) {
        let (control_tx, control_rx) = mpsc::channel(config.control_queue_capacity);
        let (presence_tx, _) = broadcast::channel(config.presence_channel_capacity);
        let registry = Self {
            table: RwLock::new(HashMap::new()),
            control_tx,
            presence_tx,
            connections: AtomicUsize::new(0),
        };
        (Arc::new(registry), ControlReceiver(control_rx))
    }

    /// Process control requests until `cancel` fires, then close every
    /// connection (each producing its own presence transition).
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, control: ControlReceiver, cancel: CancellationToken) {
        let mut rx = control.0;
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                op = rx.recv() => match op {
                    Some(op) => self.apply(op).await,
                    None => break,
                },
            }
        }

        rx.close();
        while let Ok(op) = rx.try_recv() {
            self.apply(op).await;
        }
        let closed = self.disconnect_all().await;
        info!(closed, "registry control loop stopped");
    }

    /// Subscribe to presence transitions. Subscribe before connections arrive;
    /// transitions sent while nobody listens are not replayed.
    pub fn subscribe_presence(&self) -> broadcast::Receiver<PresenceChange> {
        self.presence_tx.subscribe()
    }

    /// Add `conn` for its user. Idempotent per connection instance.
    pub async fn connect(&self, conn: Arc<ClientConnection>) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.control_tx
            .send(Control::Connect { conn, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        done.await.map_err(|_| HubError::Stopped)
    }

    /// Remove `conn` and close its queue. No-op if it is not registered.
    pub async fn disconnect(&self, conn: &ClientConnection) -> Result<(), HubError> {
        let (ack, done) = oneshot::channel();
        self.control_tx
            .send(Control::Disconnect {
                user_id: conn.user_id.clone(),
                conn_id: conn.id.clone(),
                ack,
            })
            .await
            .map_err(|_| HubError::Stopped)?;
        done.await.map_err(|_| HubError::Stopped)
    }

    /// Enqueue `event` on every local connection of `user_id`.
    ///
    /// Returns the number of connections that accepted it. A user with no
    /// local connections is a no-op.
    pub async fn deliver_to_user(&self, user_id: &UserId, event: &Envelope) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let (delivered, overflowed) = {
            let table = self.table.read().await;
            match table.get(user_id) {
                Some(set) => fan_out(set.values(), &frame),
                None => return 0,
            }
        };
        self.detach_overflowed(overflowed).await;
        debug!(user_id = %user_id, event_type = %event.event_type, delivered, "delivered to user");
        delivered
    }

    /// Enqueue `event` on every local connection of every user.
    pub async fn deliver_broadcast(&self, event: &Envelope) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };
        let (delivered, overflowed) = {
            let table = self.table.read().await;
            fan_out(table.values().flat_map(HashMap::values), &frame)
        };
        self.detach_overflowed(overflowed).await;
        debug!(event_type = %event.event_type, delivered, "delivered broadcast");
        delivered
    }

    /// Whether `user_id` has at least one connection on this process.
    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.table
            .read()
            .await
            .get(user_id)
            .is_some_and(|set| !set.is_empty())
    }

    /// Users with at least one connection on this process, sorted.
    pub async fn online_user_ids(&self) -> Vec<UserId> {
        let mut ids: Vec<UserId> = self.table.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of connections for `user_id` on this process.
    pub async fn user_connection_count(&self, user_id: &UserId) -> usize {
        self.table.read().await.get(user_id).map_or(0, HashMap::len)
    }

    /// Total connections on this process.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    async fn apply(&self, op: Control) {
        match op {
            Control::Connect { conn, ack } => {
                let mut table = self.table.write().await;
                self.attach(&mut table, conn);
                drop(table);
                let _ = ack.send(());
            }
            Control::Disconnect {
                user_id,
                conn_id,
                ack,
            } => {
                let mut table = self.table.write().await;
                let _ = self.detach(&mut table, &user_id, &conn_id);
                drop(table);
                let _ = ack.send(());
            }
        }
    }

    fn attach(&self, table: &mut Table, conn: Arc<ClientConnection>) {
        let set = table.entry(conn.user_id.clone()).or_default();
        if set.contains_key(&conn.id) {
            return;
        }
        let first = set.is_empty();
        let user_id = conn.user_id.clone();
        let conn_id = conn.id.clone();
        let _ = set.insert(conn_id.clone(), conn);
        let _ = self.connections.fetch_add(1, Ordering::Relaxed);
        debug!(user_id = %user_id, conn_id = %conn_id, "connection registered");
        if first {
            self.announce(user_id, true);
        }
    }

    fn detach(&self, table: &mut Table, user_id: &UserId, conn_id: &ConnectionId) -> bool {
        let Some(set) = table.get_mut(user_id) else {
            return false;
        };
        let Some(conn) = set.remove(conn_id) else {
            return false;
        };
        let _ = conn.close_queue();
        let _ = self.connections.fetch_sub(1, Ordering::Relaxed);
        debug!(user_id = %user_id, conn_id = %conn_id, "connection removed");
        if set.is_empty() {
            let _ = table.remove(user_id);
            self.announce(user_id.clone(), false);
        }
        true
    }

    fn announce(&self, user_id: UserId, is_online: bool) {
        if is_online {
            gauge!(HUB_ONLINE_USERS).increment(1.0);
        } else {
            gauge!(HUB_ONLINE_USERS).decrement(1.0);
        }
        info!(user_id = %user_id, is_online, "presence changed");
        // no receivers is fine: nobody is watching presence
        let _ = self.presence_tx.send(PresenceChange { user_id, is_online });
    }

    async fn detach_overflowed(&self, overflowed: Vec<Arc<ClientConnection>>) {
        if overflowed.is_empty() {
            return;
        }
        let mut table = self.table.write().await;
        for conn in overflowed {
            if self.detach(&mut table, &conn.user_id, &conn.id) {
                counter!(HUB_QUEUE_OVERFLOW_TOTAL).increment(1);
                warn!(
                    user_id = %conn.user_id,
                    conn_id = %conn.id,
                    "outbound queue full, disconnecting slow client"
                );
            }
        }
    }

    async fn disconnect_all(&self) -> usize {
        let mut table = self.table.write().await;
        let targets: Vec<(UserId, ConnectionId)> = table
            .iter()
            .flat_map(|(user, set)| set.keys().map(move |id| (user.clone(), id.clone())))
            .collect();
        targets
            .iter()
            .filter(|(user, id)| self.detach(&mut table, user, id))
            .count()
    }
}

fn encode(event: &Envelope) -> Option<Arc<str>> {
    match event.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            warn!(event_type = %event.event_type, error = %e, "failed to serialize event");
            None
        }
    }
}

fn fan_out<'a>(
    conns: impl Iterator<Item = &'a Arc<ClientConnection>>,
    frame: &Arc<str>,
) -> (usize, Vec<Arc<ClientConnection>>) {
    let mut delivered = 0;
    let mut overflowed = Vec::new();
    for conn in conns {
        match conn.send(Arc::clone(frame)) {
            Enqueue::Queued => delivered += 1,
            Enqueue::Full => overflowed.push(Arc::clone(conn)),
            Enqueue::Closed => {}
        }
    }
    counter!(HUB_FRAMES_ENQUEUED_TOTAL).increment(delivered as u64);
    (delivered, overflowed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use talkie_core::{EventKind, Identity};
    use tokio::task::JoinHandle;

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.into(),
            display_name: user.to_lowercase(),
        }
    }

    fn event(n: usize) -> Envelope {
        Envelope::new(EventKind::Typing, serde_json::json!({ "n": n })).unwrap()
    }

    fn start(config: &HubConfig) -> (Arc<Registry>, CancellationToken, JoinHandle<()>) {
        let (registry, control) = Registry::new(config);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&registry).run(control, cancel.clone()));
        (registry, cancel, handle)
    }

    fn drain(rx: &mut broadcast::Receiver<PresenceChange>) -> Vec<PresenceChange> {
        let mut out = Vec::new();
        while let Ok(change) = rx.try_recv() {
            out.push(change);
        }
        out
    }

    fn change(user: &str, is_online: bool) -> PresenceChange {
        PresenceChange {
            user_id: user.into(),
            is_online,
        }
    }

    #[tokio::test]
    async fn presence_fires_once_per_transition() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        let mut presence = registry.subscribe_presence();
        let user = UserId::from("A");

        let (a1, _r1) = ClientConnection::new(identity("A"), 8);
        let (a2, _r2) = ClientConnection::new(identity("A"), 8);
        let (a3, _r3) = ClientConnection::new(identity("A"), 8);

        registry.connect(Arc::clone(&a1)).await.unwrap();
        assert!(registry.is_online(&user).await);
        registry.connect(Arc::clone(&a2)).await.unwrap();
        registry.connect(Arc::clone(&a3)).await.unwrap();
        assert_eq!(drain(&mut presence), vec![change("A", true)]);
        assert_eq!(registry.user_connection_count(&user).await, 3);

        registry.disconnect(&a1).await.unwrap();
        registry.disconnect(&a2).await.unwrap();
        assert!(registry.is_online(&user).await);
        assert!(drain(&mut presence).is_empty());

        registry.disconnect(&a3).await.unwrap();
        assert!(!registry.is_online(&user).await);
        assert_eq!(drain(&mut presence), vec![change("A", false)]);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn reconnect_after_offline_fires_online_again() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        let mut presence = registry.subscribe_presence();

        let (a1, _r1) = ClientConnection::new(identity("A"), 8);
        registry.connect(Arc::clone(&a1)).await.unwrap();
        registry.disconnect(&a1).await.unwrap();
        let (a2, _r2) = ClientConnection::new(identity("A"), 8);
        registry.connect(a2).await.unwrap();

        assert_eq!(
            drain(&mut presence),
            vec![change("A", true), change("A", false), change("A", true)]
        );
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_disconnect_of_unknown_is_noop() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        let mut presence = registry.subscribe_presence();

        let (a1, _r1) = ClientConnection::new(identity("A"), 8);
        registry.connect(Arc::clone(&a1)).await.unwrap();
        registry.connect(Arc::clone(&a1)).await.unwrap();
        assert_eq!(registry.connection_count(), 1);

        let (stranger, _rs) = ClientConnection::new(identity("Z"), 8);
        registry.disconnect(&stranger).await.unwrap();
        assert_eq!(registry.connection_count(), 1);
        assert_eq!(drain(&mut presence), vec![change("A", true)]);
    }

    #[tokio::test]
    async fn disconnect_closes_queue() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        let (a1, mut rx) = ClientConnection::new(identity("A"), 8);
        registry.connect(Arc::clone(&a1)).await.unwrap();
        registry.disconnect(&a1).await.unwrap();
        assert!(!a1.is_open());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn deliver_to_user_preserves_order_per_connection() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        let (a1, mut rx) = ClientConnection::new(identity("A"), 8);
        registry.connect(a1).await.unwrap();

        for n in 1..=3 {
            assert_eq!(registry.deliver_to_user(&"A".into(), &event(n)).await, 1);
        }
        for n in 1..=3 {
            let frame = rx.recv().await.unwrap();
            assert_eq!(Envelope::decode(&frame).unwrap(), event(n));
        }
    }

    #[tokio::test]
    async fn deliver_to_absent_user_is_noop() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        assert_eq!(registry.deliver_to_user(&"nobody".into(), &event(1)).await, 0);
    }

    #[tokio::test]
    async fn deliver_to_user_reaches_every_connection_of_that_user_only() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        let (a1, mut ra1) = ClientConnection::new(identity("A"), 8);
        let (a2, mut ra2) = ClientConnection::new(identity("A"), 8);
        let (b1, mut rb1) = ClientConnection::new(identity("B"), 8);
        for conn in [a1, a2, b1] {
            registry.connect(conn).await.unwrap();
        }

        assert_eq!(registry.deliver_to_user(&"A".into(), &event(7)).await, 2);
        assert!(ra1.try_recv().is_ok());
        assert!(ra2.try_recv().is_ok());
        assert!(rb1.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_reaches_everyone() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        let (a1, mut ra) = ClientConnection::new(identity("A"), 8);
        let (b1, mut rb) = ClientConnection::new(identity("B"), 8);
        registry.connect(a1).await.unwrap();
        registry.connect(b1).await.unwrap();

        assert_eq!(registry.deliver_broadcast(&event(1)).await, 2);
        assert!(ra.try_recv().is_ok());
        assert!(rb.try_recv().is_ok());
        assert_eq!(
            registry.online_user_ids().await,
            vec![UserId::from("A"), UserId::from("B")]
        );
    }

    #[tokio::test]
    async fn overflow_disconnects_instead_of_blocking() {
        let config = HubConfig::default();
        assert_eq!(config.queue_capacity, 256);
        let (registry, _cancel, _h) = start(&config);
        let mut presence = registry.subscribe_presence();
        let user = UserId::from("A");

        let (a1, mut rx) = ClientConnection::new(identity("A"), config.queue_capacity);
        registry.connect(Arc::clone(&a1)).await.unwrap();
        let _ = drain(&mut presence);

        for n in 0..256 {
            assert_eq!(registry.deliver_to_user(&user, &event(n)).await, 1);
        }
        assert!(registry.is_online(&user).await);

        assert_eq!(registry.deliver_to_user(&user, &event(256)).await, 0);
        assert!(!registry.is_online(&user).await);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(drain(&mut presence), vec![change("A", false)]);

        // the 256 queued frames still drain, then the queue is closed
        let mut received = 0;
        while rx.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(received, 256);

        // the pump's own disconnect afterwards is a no-op
        registry.disconnect(&a1).await.unwrap();
        assert!(drain(&mut presence).is_empty());
    }

    #[tokio::test]
    async fn overflow_leaves_other_connections_of_same_user() {
        let (registry, _cancel, _h) = start(&HubConfig::default());
        let mut presence = registry.subscribe_presence();
        let (slow, _slow_rx) = ClientConnection::new(identity("A"), 1);
        let (fast, mut fast_rx) = ClientConnection::new(identity("A"), 8);
        registry.connect(slow).await.unwrap();
        registry.connect(fast).await.unwrap();

        let _ = registry.deliver_to_user(&"A".into(), &event(1)).await;
        let _ = fast_rx.try_recv();
        let delivered = registry.deliver_to_user(&"A".into(), &event(2)).await;

        assert_eq!(delivered, 1);
        assert_eq!(registry.user_connection_count(&"A".into()).await, 1);
        assert!(registry.is_online(&"A".into()).await);
        assert_eq!(drain(&mut presence), vec![change("A", true)]);
    }

    #[tokio::test]
    async fn shutdown_disconnects_everyone() {
        let (registry, cancel, handle) = start(&HubConfig::default());
        let mut presence = registry.subscribe_presence();
        let (a1, mut ra) = ClientConnection::new(identity("A"), 8);
        let (b1, mut rb) = ClientConnection::new(identity("B"), 8);
        registry.connect(a1).await.unwrap();
        registry.connect(b1).await.unwrap();
        let _ = drain(&mut presence);

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(registry.connection_count(), 0);
        assert!(ra.recv().await.is_none());
        assert!(rb.recv().await.is_none());
        let mut offline = drain(&mut presence);
        offline.sort_by(|x, y| x.user_id.cmp(&y.user_id));
        assert_eq!(offline, vec![change("A", false), change("B", false)]);

        let (late, _rl) = ClientConnection::new(identity("C"), 8);
        assert_eq!(registry.connect(late).await, Err(HubError::Stopped));
    }
}
