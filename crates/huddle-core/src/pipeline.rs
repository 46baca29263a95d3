//! Message delivery pipeline.
//!
//! Turns an inbound message submission into a persisted record with correct
//! aggregate side effects and real-time propagation, and handles bulk read
//! receipts.

use crate::error::CoreError;
use crate::presence::PresenceRegistry;
use crate::rooms::{conversation_room, RoomRegistry};
use crate::store::Store;
use crate::types::{Message, MessageId, UserId};
use chrono::Utc;
use huddle_protocol::{MessageKind, ServerEvent};
use std::sync::Arc;
use tracing::{debug, warn};

/// The message delivery pipeline.
pub struct MessagePipeline {
    store: Arc<dyn Store>,
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomRegistry>,
}

impl MessagePipeline {
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        presence: Arc<PresenceRegistry>,
        rooms: Arc<RoomRegistry>,
    ) -> Self {
        Self {
            store,
            presence,
            rooms,
        }
    }

    /// Submit a message to a conversation.
    ///
    /// The message create is the primary write and aborts the operation on
    /// failure. The unread-counter update is a UX hint: its failure is
    /// logged and delivery proceeds on the already-durable message.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown conversation, `Unauthorized` when the
    /// sender is not a participant, `Store` when the primary write fails.
    pub async fn send_message(
        &self,
        sender_id: &str,
        conversation_id: &str,
        content: String,
        kind: MessageKind,
        reply_to: Option<MessageId>,
    ) -> Result<Message, CoreError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(conversation_id.to_string()))?;

        if !conversation.is_participant(sender_id) {
            return Err(CoreError::Unauthorized(conversation_id.to_string()));
        }

        let mut message = Message::new(conversation_id, sender_id, content, kind, reply_to);
        self.store.create_message(&message).await?;

        if let Err(e) = self
            .store
            .record_message_activity(conversation_id, &message.id, sender_id)
            .await
        {
            warn!(
                conversation = %conversation_id,
                message = %message.id,
                error = %e,
                "Unread counter update failed; continuing delivery"
            );
        }

        let room = conversation_room(conversation_id);
        self.rooms.publish(
            &room,
            ServerEvent::NewMessage {
                message: message.to_event(),
            },
        );

        let online: Vec<UserId> = conversation
            .recipients(sender_id)
            .into_iter()
            .filter(|p| self.presence.is_online(p))
            .collect();

        if !online.is_empty() {
            match self.store.mark_delivered(&message.id, &online, Utc::now()).await {
                Ok(updated) => {
                    self.rooms.publish(
                        &room,
                        ServerEvent::MessageStatusUpdate {
                            message_id: updated.id.clone(),
                            conversation_id: conversation_id.to_string(),
                            status: updated.status,
                        },
                    );
                    message = updated;
                }
                Err(e) => {
                    warn!(
                        message = %message.id,
                        error = %e,
                        "Delivery receipt persist failed"
                    );
                }
            }
        }

        debug!(
            conversation = %conversation_id,
            message = %message.id,
            online_recipients = online.len(),
            status = ?message.status,
            "Message delivered"
        );

        Ok(message)
    }

    /// Mark every message in the conversation as read by `reader_id`.
    ///
    /// Bulk and idempotent: a second call with no intervening message
    /// transitions nothing and leaves the persisted state unchanged.
    ///
    /// # Errors
    ///
    /// `NotFound` / `Unauthorized` as for [`send_message`](Self::send_message).
    pub async fn mark_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
    ) -> Result<Vec<MessageId>, CoreError> {
        let conversation = self
            .store
            .get_conversation(conversation_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(conversation_id.to_string()))?;

        if !conversation.is_participant(reader_id) {
            return Err(CoreError::Unauthorized(conversation_id.to_string()));
        }

        let transitioned = self
            .store
            .mark_conversation_read(conversation_id, reader_id, Utc::now())
            .await?;

        if let Err(e) = self.store.reset_unread(conversation_id, reader_id).await {
            warn!(
                conversation = %conversation_id,
                reader = %reader_id,
                error = %e,
                "Unread counter reset failed"
            );
        }

        self.rooms.publish(
            &conversation_room(conversation_id),
            ServerEvent::MessagesRead {
                conversation_id: conversation_id.to_string(),
                user_id: reader_id.to_string(),
            },
        );

        debug!(
            conversation = %conversation_id,
            reader = %reader_id,
            transitioned = transitioned.len(),
            "Conversation marked read"
        );

        Ok(transitioned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::types::Conversation;
    use huddle_protocol::MessageStatus;
    use tokio::sync::{broadcast, mpsc};

    struct Setup {
        store: Arc<MemoryStore>,
        presence: Arc<PresenceRegistry>,
        rooms: Arc<RoomRegistry>,
        pipeline: MessagePipeline,
    }

    fn setup() -> Setup {
        let store = Arc::new(MemoryStore::new());
        store.add_conversation(Conversation::new_private("c1", "alice", "bob"));
        let presence = Arc::new(PresenceRegistry::new(store.clone()));
        let rooms = Arc::new(RoomRegistry::new());
        let pipeline = MessagePipeline::new(store.clone(), presence.clone(), rooms.clone());
        Setup {
            store,
            presence,
            rooms,
            pipeline,
        }
    }

    fn connect(setup: &Setup, user: &str, conn: &str) -> broadcast::Receiver<Arc<ServerEvent>> {
        let (tx, _rx) = mpsc::unbounded_channel();
        setup.presence.connect(user, conn, tx);
        setup.rooms.subscribe(conn, "conv:c1").unwrap()
    }

    #[tokio::test]
    async fn test_delivery_to_online_recipient() {
        let setup = setup();
        let mut bob_rx = connect(&setup, "bob", "conn-b");

        let message = setup
            .pipeline
            .send_message("alice", "c1", "hello".into(), MessageKind::Text, None)
            .await
            .unwrap();

        // new-message first, then the delivered status update
        match &*bob_rx.try_recv().unwrap() {
            ServerEvent::NewMessage { message: m } => assert_eq!(m.content, "hello"),
            other => panic!("unexpected event: {other:?}"),
        }
        match &*bob_rx.try_recv().unwrap() {
            ServerEvent::MessageStatusUpdate { status, .. } => {
                assert_eq!(*status, MessageStatus::Delivered);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(message.status, MessageStatus::Delivered);
        assert_eq!(message.delivered_to.len(), 1);

        let conv = setup.store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.unread_count.get("bob"), Some(&1));
        assert_eq!(conv.last_message_id.as_deref(), Some(message.id.as_str()));
    }

    #[tokio::test]
    async fn test_no_online_recipient_stays_sent() {
        let setup = setup();

        let message = setup
            .pipeline
            .send_message("alice", "c1", "hello".into(), MessageKind::Text, None)
            .await
            .unwrap();

        assert_eq!(message.status, MessageStatus::Sent);
        assert!(message.delivered_to.is_empty());
    }

    #[tokio::test]
    async fn test_sender_must_be_participant() {
        let setup = setup();

        let err = setup
            .pipeline
            .send_message("mallory", "c1", "hi".into(), MessageKind::Text, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));

        let err = setup
            .pipeline
            .send_message("alice", "nope", "hi".into(), MessageKind::Text, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_read_is_idempotent() {
        let setup = setup();
        let _bob_rx = connect(&setup, "bob", "conn-b");

        let message = setup
            .pipeline
            .send_message("alice", "c1", "hello".into(), MessageKind::Text, None)
            .await
            .unwrap();

        let first = setup.pipeline.mark_read("c1", "bob").await.unwrap();
        assert_eq!(first, vec![message.id.clone()]);

        let second = setup.pipeline.mark_read("c1", "bob").await.unwrap();
        assert!(second.is_empty());

        let conv = setup.store.get_conversation("c1").await.unwrap().unwrap();
        assert_eq!(conv.unread_count.get("bob"), Some(&0));

        let stored = setup.store.get_message(&message.id).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
        assert_eq!(stored.read_by.len(), 1);
    }

    #[tokio::test]
    async fn test_status_monotonic_after_read() {
        let setup = setup();
        let _bob_rx = connect(&setup, "bob", "conn-b");

        let message = setup
            .pipeline
            .send_message("alice", "c1", "hello".into(), MessageKind::Text, None)
            .await
            .unwrap();
        setup.pipeline.mark_read("c1", "bob").await.unwrap();

        // A late delivery receipt must not regress the status
        let stored = setup
            .store
            .mark_delivered(&message.id, &["bob".into()], Utc::now())
            .await
            .unwrap();
        assert_eq!(stored.status, MessageStatus::Read);
    }
}
