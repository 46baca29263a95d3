//! Broadcast fan-out groups for Huddle.
//!
//! A room is a logical broadcast group: every conversation has one, and
//! each live call gets one keyed by its room id. Delivery is at-most-once
//! to currently-subscribed connections; offline members miss live traffic
//! and reconcile through the pull-based read path when they reconnect.

use crate::types::ConnectionId;
use dashmap::{DashMap, DashSet};
use huddle_protocol::ServerEvent;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Room key for a conversation's fan-out group.
#[must_use]
pub fn conversation_room(conversation_id: &str) -> String {
    format!("conv:{conversation_id}")
}

/// Room key for a call's signaling group.
#[must_use]
pub fn call_room(room_id: &str) -> String {
    format!("call:{room_id}")
}

/// Room errors.
#[derive(Debug, Error)]
pub enum RoomError {
    /// Not subscribed to room.
    #[error("Not subscribed to room: {0}")]
    NotSubscribed(String),

    /// Already subscribed to room.
    #[error("Already subscribed to room: {0}")]
    AlreadySubscribed(String),

    /// Maximum subscriptions reached.
    #[error("Maximum subscriptions reached")]
    MaxSubscriptionsReached,
}

/// Room registry configuration.
#[derive(Debug, Clone)]
pub struct RoomsConfig {
    /// Broadcast capacity per room.
    pub room_capacity: usize,
    /// Maximum rooms a single connection may join.
    pub max_rooms_per_connection: usize,
}

impl Default for RoomsConfig {
    fn default() -> Self {
        Self {
            room_capacity: 1024,
            max_rooms_per_connection: 256,
        }
    }
}

/// A single fan-out group.
struct Room {
    sender: broadcast::Sender<Arc<ServerEvent>>,
    subscribers: HashSet<ConnectionId>,
}

impl Room {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            subscribers: HashSet::new(),
        }
    }
}

/// The room registry.
///
/// Rooms are created on first subscribe and deleted when the last
/// subscriber leaves. Events published from a single publisher path reach
/// each subscribed connection in publish order; ordering across racing
/// publishers is unspecified.
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    /// Connection subscriptions (connection id -> set of room keys).
    subscriptions: DashMap<ConnectionId, DashSet<String>>,
    config: RoomsConfig,
}

impl RoomRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RoomsConfig::default())
    }

    #[must_use]
    pub fn with_config(config: RoomsConfig) -> Self {
        Self {
            rooms: DashMap::new(),
            subscriptions: DashMap::new(),
            config,
        }
    }

    /// Subscribe a connection to a room.
    ///
    /// Returns a receiver for events published to the room.
    ///
    /// # Errors
    ///
    /// Returns an error if already subscribed or the per-connection limit
    /// is hit.
    pub fn subscribe(
        &self,
        connection_id: &str,
        room_key: &str,
    ) -> Result<broadcast::Receiver<Arc<ServerEvent>>, RoomError> {
        let conn_subs = self
            .subscriptions
            .entry(connection_id.to_string())
            .or_default();

        if conn_subs.len() >= self.config.max_rooms_per_connection {
            return Err(RoomError::MaxSubscriptionsReached);
        }

        if conn_subs.contains(room_key) {
            return Err(RoomError::AlreadySubscribed(room_key.to_string()));
        }

        let mut room = self
            .rooms
            .entry(room_key.to_string())
            .or_insert_with(|| {
                debug!(room = %room_key, "Creating room");
                Room::new(self.config.room_capacity)
            });

        room.subscribers.insert(connection_id.to_string());
        let receiver = room.sender.subscribe();
        conn_subs.insert(room_key.to_string());

        debug!(
            room = %room_key,
            connection = %connection_id,
            subscribers = room.subscribers.len(),
            "Subscribed"
        );

        Ok(receiver)
    }

    /// Unsubscribe a connection from a room.
    ///
    /// # Errors
    ///
    /// Returns an error if not subscribed.
    pub fn unsubscribe(&self, connection_id: &str, room_key: &str) -> Result<(), RoomError> {
        match self.subscriptions.get(connection_id) {
            Some(conn_subs) if conn_subs.remove(room_key).is_some() => {}
            _ => return Err(RoomError::NotSubscribed(room_key.to_string())),
        }

        if let Some(mut room) = self.rooms.get_mut(room_key) {
            room.subscribers.remove(connection_id);

            debug!(
                room = %room_key,
                connection = %connection_id,
                subscribers = room.subscribers.len(),
                "Unsubscribed"
            );

            if room.subscribers.is_empty() {
                drop(room); // Release the shard lock
                self.rooms.remove(room_key);
                debug!(room = %room_key, "Deleted empty room");
            }
        }

        Ok(())
    }

    /// Unsubscribe a connection from all rooms.
    pub fn unsubscribe_all(&self, connection_id: &str) {
        if let Some((_, room_keys)) = self.subscriptions.remove(connection_id) {
            for room_key in room_keys.iter() {
                if let Some(mut room) = self.rooms.get_mut(room_key.as_str()) {
                    room.subscribers.remove(connection_id);
                    if room.subscribers.is_empty() {
                        let key = room_key.clone();
                        drop(room);
                        self.rooms.remove(&key);
                    }
                }
            }
        }

        debug!(connection = %connection_id, "Unsubscribed from all rooms");
    }

    /// Publish an event to a room.
    ///
    /// Returns the number of subscribed connections that received it.
    pub fn publish(&self, room_key: &str, event: ServerEvent) -> usize {
        match self.rooms.get(room_key) {
            Some(room) => {
                let count = room.sender.send(Arc::new(event)).unwrap_or_default();
                trace!(room = %room_key, recipients = count, "Published event");
                count
            }
            None => {
                warn!(room = %room_key, "Publish to non-existent room");
                0
            }
        }
    }

    #[must_use]
    pub fn room_exists(&self, room_key: &str) -> bool {
        self.rooms.contains_key(room_key)
    }

    #[must_use]
    pub fn subscriber_count(&self, room_key: &str) -> usize {
        self.rooms
            .get(room_key)
            .map(|r| r.subscribers.len())
            .unwrap_or(0)
    }

    /// Number of active rooms.
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Rooms a connection is subscribed to.
    #[must_use]
    pub fn connection_rooms(&self, connection_id: &str) -> Vec<String> {
        self.subscriptions
            .get(connection_id)
            .map(|s| s.iter().map(|r| r.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}
