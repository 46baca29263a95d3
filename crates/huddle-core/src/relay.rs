//! Opaque signal relaying.
//!
//! WebRTC payloads (SDP, ICE candidates, renegotiation blobs) are never
//! inspected; the relay only decides where a frame goes. User-directed
//! frames go over the target's live connection, room-directed frames fan
//! out through the room registry.

use crate::presence::PresenceRegistry;
use crate::rooms::RoomRegistry;
use huddle_protocol::ServerEvent;
use std::sync::Arc;
use tracing::trace;

pub struct SignalRelay {
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl SignalRelay {
    #[must_use]
    pub fn new(presence: Arc<PresenceRegistry>, rooms: Arc<RoomRegistry>) -> Self {
        Self { presence, rooms }
    }

    /// Relay a frame to a single user's live connection.
    ///
    /// When the target has no live connection the sender gets a
    /// `user-unavailable` report instead and `false` is returned.
    pub fn relay_to_user(&self, from: &str, to: &str, event: ServerEvent) -> bool {
        if self.presence.send_to_user(to, Arc::new(event)) {
            true
        } else {
            trace!(from = %from, to = %to, "Relay target offline");
            self.presence
                .send_to_user(from, Arc::new(ServerEvent::user_unavailable(to.to_string())));
            false
        }
    }

    /// Fan a frame out to every subscriber of a room.
    ///
    /// Returns the number of connections reached; zero when the room does
    /// not exist.
    pub fn relay_to_room(&self, room_key: &str, event: ServerEvent) -> usize {
        self.rooms.publish(room_key, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::rooms::call_room;
    use crate::store::Store;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<PresenceRegistry>, Arc<RoomRegistry>, SignalRelay) {
        let store = Arc::new(MemoryStore::new()) as Arc<dyn Store>;
        let presence = Arc::new(PresenceRegistry::new(store));
        let rooms = Arc::new(RoomRegistry::new());
        let relay = SignalRelay::new(presence.clone(), rooms.clone());
        (presence, rooms, relay)
    }

    #[tokio::test]
    async fn test_relay_to_online_user() {
        let (presence, _rooms, relay) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        presence.connect("bob", "c1".to_string(), tx);

        let delivered = relay.relay_to_user(
            "alice",
            "bob",
            ServerEvent::IceCandidate {
                candidate: json!({"candidate": "udp 1 ..."}),
                from: "alice".to_string(),
            },
        );
        assert!(delivered);
        assert!(matches!(
            &*rx.recv().await.unwrap(),
            ServerEvent::IceCandidate { .. }
        ));
    }

    #[tokio::test]
    async fn test_offline_target_reports_unavailable_to_sender() {
        let (presence, _rooms, relay) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        presence.connect("alice", "c1".to_string(), tx);

        let delivered = relay.relay_to_user(
            "alice",
            "bob",
            ServerEvent::IceCandidate {
                candidate: json!({}),
                from: "alice".to_string(),
            },
        );
        assert!(!delivered);
        match &*rx.recv().await.unwrap() {
            ServerEvent::UserUnavailable { user_id } => assert_eq!(user_id, "bob"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_room_relay_reaches_subscribers() {
        let (_presence, rooms, relay) = setup();
        let key = call_room("room_1");
        let mut rx_a = rooms.subscribe("conn-a", &key).unwrap();
        let mut rx_b = rooms.subscribe("conn-b", &key).unwrap();

        let reached = relay.relay_to_room(
            &key,
            ServerEvent::UserJoinedCall {
                room_id: "room_1".to_string(),
                user_id: "carol".to_string(),
                user_name: "Carol".to_string(),
            },
        );
        assert_eq!(reached, 2);
        assert!(matches!(
            &*rx_a.recv().await.unwrap(),
            ServerEvent::UserJoinedCall { .. }
        ));
        assert!(matches!(
            &*rx_b.recv().await.unwrap(),
            ServerEvent::UserLeftCall { .. } | ServerEvent::UserJoinedCall { .. }
        ));

        assert_eq!(relay.relay_to_room(&call_room("nope"), ServerEvent::Pong), 0);
    }
}
