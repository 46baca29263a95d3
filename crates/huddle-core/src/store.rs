//! The persistence collaborator.
//!
//! Everything durable (conversations, messages, calls, user presence flags)
//! goes through this trait. The coordination layer treats it as an external
//! service: primary writes abort their operation on failure, best-effort
//! writes are logged and swallowed.

use crate::types::{Call, Conversation, Message, MessageId, UserId, UserProfile};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend failure (connection, constraint, serialization).
    #[error("Backend error: {0}")]
    Backend(String),
}

/// The durable store contract.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Users ──────────────────────────────────────────────────────────

    async fn get_user(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// Record the user's online flag and last-seen timestamp.
    ///
    /// Callers treat this as best-effort: in-memory presence is
    /// authoritative for routing even if this write fails.
    async fn set_user_presence(
        &self,
        user_id: &str,
        online: bool,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // ── Conversations ──────────────────────────────────────────────────

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, StoreError>;

    async fn conversations_for_user(&self, user_id: &str)
        -> Result<Vec<Conversation>, StoreError>;

    /// Resolve the 1:1 conversation between two users, creating it if absent.
    async fn find_or_create_private(
        &self,
        a: &str,
        b: &str,
    ) -> Result<Conversation, StoreError>;

    /// Apply the aggregate side effects of a new message as one unit:
    /// increment the unread counter for every participant except the sender
    /// and set `last_message_id`.
    async fn record_message_activity(
        &self,
        conversation_id: &str,
        message_id: &str,
        sender_id: &str,
    ) -> Result<(), StoreError>;

    async fn reset_unread(&self, conversation_id: &str, user_id: &str) -> Result<(), StoreError>;

    // ── Messages ───────────────────────────────────────────────────────

    async fn create_message(&self, message: &Message) -> Result<(), StoreError>;

    async fn get_message(&self, id: &str) -> Result<Option<Message>, StoreError>;

    /// Append delivery receipts for the given recipients and promote the
    /// collapsed status monotonically. Returns the updated message.
    async fn mark_delivered(
        &self,
        message_id: &str,
        recipients: &[UserId],
        at: DateTime<Utc>,
    ) -> Result<Message, StoreError>;

    /// Transition every message in the conversation authored by someone
    /// other than `reader_id` and not yet read by them to `Read`, appending
    /// a read receipt. Returns the ids that transitioned. Idempotent.
    async fn mark_conversation_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        at: DateTime<Utc>,
    ) -> Result<Vec<MessageId>, StoreError>;

    // ── Calls ──────────────────────────────────────────────────────────

    async fn create_call(&self, call: &Call) -> Result<(), StoreError>;

    async fn get_call(&self, id: &str) -> Result<Option<Call>, StoreError>;

    /// Replace the stored call record. Callers serialize per call id, so
    /// this is a plain upsert.
    async fn put_call(&self, call: &Call) -> Result<(), StoreError>;
}
