//! In-memory store implementation.
//!
//! Backs the dev server and the test suites. Sharded maps keep the same
//! interleaving behavior a remote store would have at the trait boundary.

use crate::store::{Store, StoreError};
use crate::types::{Call, Conversation, Message, MessageId, UserId, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use huddle_protocol::MessageStatus;

/// In-memory [`Store`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<UserId, UserProfile>,
    presence_flags: DashMap<UserId, (bool, DateTime<Utc>)>,
    conversations: DashMap<String, Conversation>,
    messages: DashMap<MessageId, Message>,
    /// Message ids per conversation, in insertion order.
    conversation_messages: DashMap<String, Vec<MessageId>>,
    calls: DashMap<String, Call>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user profile.
    pub fn add_user(&self, profile: UserProfile) {
        self.users.insert(profile.id.clone(), profile);
    }

    /// Seed a conversation.
    pub fn add_conversation(&self, conversation: Conversation) {
        self.conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// Stored online flag and last-seen, if any presence write happened.
    #[must_use]
    pub fn presence_flag(&self, user_id: &str) -> Option<(bool, DateTime<Utc>)> {
        self.presence_flags.get(user_id).map(|e| *e.value())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        Ok(self.users.get(user_id).map(|e| e.value().clone()))
    }

    async fn set_user_presence(
        &self,
        user_id: &str,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.presence_flags.insert(user_id.to_string(), (online, at));
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.get(id).map(|e| e.value().clone()))
    }

    async fn conversations_for_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        Ok(self
            .conversations
            .iter()
            .filter(|e| e.value().is_participant(user_id))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn find_or_create_private(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Conversation, StoreError> {
        let existing = self.conversations.iter().find_map(|e| {
            let c = e.value();
            if !c.is_group && c.is_participant(a) && c.is_participant(b) {
                Some(c.clone())
            } else {
                None
            }
        });
        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        let conversation =
            Conversation::new_private(uuid::Uuid::new_v4().to_string(), a, b);
        self.conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn record_message_activity(
        &self,
        conversation_id: &str,
        message_id: &str,
        sender_id: &str,
    ) -> Result<(), StoreError> {
        let mut entry = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;

        let conversation = entry.value_mut();
        let participants = conversation.participant_ids.clone();
        for p in participants {
            if p != sender_id {
                *conversation.unread_count.entry(p).or_insert(0) += 1;
            }
        }
        conversation.last_message_id = Some(message_id.to_string());
        Ok(())
    }

    async fn reset_unread(&self, conversation_id: &str, user_id: &str) -> Result<(), StoreError> {
        let mut entry = self
            .conversations
            .get_mut(conversation_id)
            .ok_or_else(|| StoreError::NotFound(conversation_id.to_string()))?;
        entry.unread_count.insert(user_id.to_string(), 0);
        Ok(())
    }

    async fn create_message(&self, message: &Message) -> Result<(), StoreError> {
        self.conversation_messages
            .entry(message.conversation_id.clone())
            .or_default()
            .push(message.id.clone());
        self.messages.insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.get(id).map(|e| e.value().clone()))
    }

    async fn mark_delivered(
        &self,
        message_id: &str,
        recipients: &[UserId],
        at: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        let mut entry = self
            .messages
            .get_mut(message_id)
            .ok_or_else(|| StoreError::NotFound(message_id.to_string()))?;

        let message = entry.value_mut();
        for recipient in recipients {
            let already = message
                .delivered_to
                .iter()
                .any(|r| &r.user_id == recipient);
            if !already && recipient != &message.sender_id {
                message.delivered_to.push(crate::types::Receipt {
                    user_id: recipient.clone(),
                    at,
                });
            }
        }
        if !message.delivered_to.is_empty() {
            message.promote(MessageStatus::Delivered);
        }
        Ok(message.clone())
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, StoreError> {
        let ids = self
            .conversation_messages
            .get(conversation_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut transitioned = Vec::new();
        for id in ids {
            if let Some(mut entry) = self.messages.get_mut(&id) {
                let message = entry.value_mut();
                if message.sender_id != reader_id && !message.read_by_user(reader_id) {
                    message.read_by.push(crate::types::Receipt {
                        user_id: reader_id.to_string(),
                        at,
                    });
                    message.promote(MessageStatus::Read);
                    transitioned.push(id);
                }
            }
        }
        Ok(transitioned)
    }

    async fn create_call(&self, call: &Call) -> Result<(), StoreError> {
        self.calls.insert(call.id.clone(), call.clone());
        Ok(())
    }

    async fn get_call(&self, id: &str) -> Result<Option<Call>, StoreError> {
        Ok(self.calls.get(id).map(|e| e.value().clone()))
    }

    async fn put_call(&self, call: &Call) -> Result<(), StoreError> {
        self.calls.insert(call.id.clone(), call.clone());
        Ok(())
    }
}
