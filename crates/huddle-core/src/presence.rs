//! Presence tracking for Huddle.
//!
//! The registry owns the bidirectional mapping between user identity and
//! the live connection, and is the routing authority for every other
//! component. Policy: at most one connection per user; the newly connecting
//! device wins and the superseded connection is orphaned from routing.

use crate::store::Store;
use crate::types::{ConnectionId, UserId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use huddle_protocol::ServerEvent;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Outbound handle for a connection's event loop.
pub type EventSender = mpsc::UnboundedSender<Arc<ServerEvent>>;

/// Presence state for a single user.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    /// The live connection.
    pub connection_id: ConnectionId,
    /// Outbound routing handle.
    pub sender: EventSender,
    /// Last activity timestamp.
    pub last_seen: DateTime<Utc>,
}

/// The presence registry.
///
/// Durable online/offline writes go through the store as fire-and-forget
/// tasks; registry state stays authoritative for routing even when the
/// durable copy lags.
pub struct PresenceRegistry {
    store: Arc<dyn Store>,
    by_user: DashMap<UserId, PresenceEntry>,
    by_connection: DashMap<ConnectionId, UserId>,
}

impl PresenceRegistry {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            by_user: DashMap::new(),
            by_connection: DashMap::new(),
        }
    }

    /// Register a connection for a user, superseding any prior one.
    ///
    /// Returns the superseded connection id, if any. The old socket is not
    /// closed here; it simply no longer routes.
    pub fn connect(
        &self,
        user_id: impl Into<UserId>,
        connection_id: impl Into<ConnectionId>,
        sender: EventSender,
    ) -> Option<ConnectionId> {
        let user_id = user_id.into();
        let connection_id = connection_id.into();

        self.by_connection
            .insert(connection_id.clone(), user_id.clone());

        let superseded = self.by_user.insert(
            user_id.clone(),
            PresenceEntry {
                connection_id: connection_id.clone(),
                sender,
                last_seen: Utc::now(),
            },
        );

        let superseded = superseded.map(|old| {
            self.by_connection.remove(&old.connection_id);
            old.connection_id
        });

        debug!(user = %user_id, connection = %connection_id, superseded = ?superseded, "Presence: connected");

        self.record_presence(user_id, true);
        superseded
    }

    /// Deregister a connection.
    ///
    /// Removes the mapping only if the stored connection id still matches;
    /// a stale disconnect from an already-superseded socket is a no-op.
    /// Returns the user who went offline, if any.
    pub fn disconnect(&self, connection_id: &str) -> Option<UserId> {
        let (_, user_id) = self.by_connection.remove(connection_id)?;

        let removed = self
            .by_user
            .remove_if(&user_id, |_, entry| entry.connection_id == connection_id);

        if removed.is_none() {
            debug!(user = %user_id, connection = %connection_id, "Presence: stale disconnect ignored");
            return None;
        }

        debug!(user = %user_id, connection = %connection_id, "Presence: disconnected");
        self.record_presence(user_id.clone(), false);
        Some(user_id)
    }

    /// Current routing target for a user.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionId> {
        self.by_user.get(user_id).map(|e| e.connection_id.clone())
    }

    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.by_user.contains_key(user_id)
    }

    /// User that owns the given connection, if it is still live.
    #[must_use]
    pub fn user_of(&self, connection_id: &str) -> Option<UserId> {
        self.by_connection
            .get(connection_id)
            .map(|e| e.value().clone())
    }

    /// Deliver an event to a user's live connection.
    ///
    /// Returns `false` on a routing miss (offline, or the receiving loop is
    /// gone); the caller decides whether that matters.
    pub fn send_to_user(&self, user_id: &str, event: Arc<ServerEvent>) -> bool {
        match self.by_user.get(user_id) {
            Some(entry) => entry.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Fire-and-forget broadcast to every connected user except one.
    ///
    /// No acknowledgment, no retry: presence is eventually consistent.
    pub fn broadcast(&self, event: &Arc<ServerEvent>, except: &str) -> usize {
        let mut delivered = 0;
        for entry in self.by_user.iter() {
            if entry.key() != except && entry.value().sender.send(Arc::clone(event)).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Update a connection's last-seen timestamp.
    pub fn touch(&self, connection_id: &str) {
        if let Some(user_id) = self.user_of(connection_id) {
            if let Some(mut entry) = self.by_user.get_mut(&user_id) {
                if entry.connection_id == connection_id {
                    entry.last_seen = Utc::now();
                }
            }
        }
    }

    /// Number of users currently online.
    #[must_use]
    pub fn online_count(&self) -> usize {
        self.by_user.len()
    }

    /// Best-effort durable presence write; failure never blocks the
    /// connection lifecycle.
    fn record_presence(&self, user_id: UserId, online: bool) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.set_user_presence(&user_id, online, Utc::now()).await {
                warn!(user = %user_id, online, error = %e, "Presence: durable write failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn registry() -> (PresenceRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (PresenceRegistry::new(store.clone()), store)
    }

    fn sender() -> (EventSender, mpsc::UnboundedReceiver<Arc<ServerEvent>>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn test_connect_supersedes() {
        let (registry, _) = registry();
        let (tx1, _rx1) = sender();
        let (tx2, _rx2) = sender();

        assert!(registry.connect("alice", "conn-1", tx1).is_none());
        let superseded = registry.connect("alice", "conn-2", tx2);
        assert_eq!(superseded.as_deref(), Some("conn-1"));

        // Lookup always reflects the most recent connection
        assert_eq!(registry.lookup("alice").as_deref(), Some("conn-2"));
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_noop() {
        let (registry, _) = registry();
        let (tx1, _rx1) = sender();
        let (tx2, _rx2) = sender();

        registry.connect("alice", "conn-1", tx1);
        registry.connect("alice", "conn-2", tx2);

        // The old socket finally times out; routing must survive
        assert!(registry.disconnect("conn-1").is_none());
        assert_eq!(registry.lookup("alice").as_deref(), Some("conn-2"));

        assert_eq!(registry.disconnect("conn-2").as_deref(), Some("alice"));
        assert!(registry.lookup("alice").is_none());
    }

    #[tokio::test]
    async fn test_send_and_broadcast() {
        let (registry, _) = registry();
        let (tx_a, mut rx_a) = sender();
        let (tx_b, mut rx_b) = sender();

        registry.connect("alice", "conn-a", tx_a);
        registry.connect("bob", "conn-b", tx_b);

        assert!(registry.send_to_user("bob", Arc::new(ServerEvent::Pong)));
        assert!(!registry.send_to_user("carol", Arc::new(ServerEvent::Pong)));
        assert_eq!(*rx_b.recv().await.unwrap(), ServerEvent::Pong);

        let online = Arc::new(ServerEvent::UserOnline {
            user_id: "bob".into(),
        });
        let delivered = registry.broadcast(&online, "bob");
        assert_eq!(delivered, 1);
        assert!(matches!(
            *rx_a.recv().await.unwrap(),
            ServerEvent::UserOnline { .. }
        ));
    }

    #[tokio::test]
    async fn test_durable_presence_write_is_best_effort() {
        let (registry, store) = registry();
        let (tx, _rx) = sender();

        registry.connect("alice", "conn-1", tx);
        // Let the spawned write run
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        let (online, _) = store.presence_flag("alice").expect("flag written");
        assert!(online);
    }
}
