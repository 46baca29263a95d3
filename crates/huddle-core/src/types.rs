//! Domain entities owned by the coordination layer.
//!
//! Conversations, messages, and calls are durable entities read and written
//! through the [`Store`](crate::store::Store) collaborator; presence entries
//! and active call sessions are in-memory only and live in their registries.

use chrono::{DateTime, Utc};
use huddle_protocol::{CallKind, MessageEvent, MessageKind, MessageStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type UserId = String;
pub type ConnectionId = String;
pub type ConversationId = String;
pub type MessageId = String;
pub type CallId = String;
pub type RoomId = String;

/// Durable user identity, resolved by the authentication verifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub name: String,
    pub avatar_url: Option<String>,
}

/// A conversation aggregate.
///
/// `unread_count` is defined only for participants; keys are removed when a
/// participant leaves (a CRUD concern outside this core).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub participant_ids: Vec<UserId>,
    pub unread_count: HashMap<UserId, u64>,
    pub last_message_id: Option<MessageId>,
    pub is_group: bool,
}

impl Conversation {
    /// Create a 1:1 conversation between two users.
    #[must_use]
    pub fn new_private(id: impl Into<ConversationId>, a: impl Into<UserId>, b: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            participant_ids: vec![a.into(), b.into()],
            unread_count: HashMap::new(),
            last_message_id: None,
            is_group: false,
        }
    }

    /// Create a group conversation.
    #[must_use]
    pub fn new_group(id: impl Into<ConversationId>, participants: Vec<UserId>) -> Self {
        Self {
            id: id.into(),
            participant_ids: participants,
            unread_count: HashMap::new(),
            last_message_id: None,
            is_group: true,
        }
    }

    #[must_use]
    pub fn is_participant(&self, user_id: &str) -> bool {
        self.participant_ids.iter().any(|p| p == user_id)
    }

    /// Participants other than the given user.
    #[must_use]
    pub fn recipients(&self, sender: &str) -> Vec<UserId> {
        self.participant_ids
            .iter()
            .filter(|p| p.as_str() != sender)
            .cloned()
            .collect()
    }
}

/// A per-recipient delivery or read acknowledgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Receipt {
    pub user_id: UserId,
    pub at: DateTime<Utc>,
}

/// A persisted message with per-recipient receipts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub delivered_to: Vec<Receipt>,
    pub read_by: Vec<Receipt>,
    pub reply_to: Option<MessageId>,
    pub sent_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message in the `Sent` stage.
    #[must_use]
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        sender_id: impl Into<UserId>,
        content: impl Into<String>,
        kind: MessageKind,
        reply_to: Option<MessageId>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            content: content.into(),
            kind,
            status: MessageStatus::Sent,
            delivered_to: Vec::new(),
            read_by: Vec::new(),
            reply_to,
            sent_at: Utc::now(),
        }
    }

    /// Promote the collapsed status monotonically; regression is a no-op.
    pub fn promote(&mut self, stage: MessageStatus) {
        if stage > self.status {
            self.status = stage;
        }
    }

    /// Whether the given user already has a read receipt.
    #[must_use]
    pub fn read_by_user(&self, user_id: &str) -> bool {
        self.read_by.iter().any(|r| r.user_id == user_id)
    }

    /// Wire view of this message.
    #[must_use]
    pub fn to_event(&self) -> MessageEvent {
        MessageEvent {
            id: self.id.clone(),
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            content: self.content.clone(),
            kind: self.kind,
            status: self.status,
            reply_to: self.reply_to.clone(),
            sent_at: self.sent_at.timestamp_millis(),
        }
    }
}

/// Per-participant call leg status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    Pending,
    Accepted,
    Rejected,
    Missed,
    Busy,
}

/// Top-level call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ringing,
    Ongoing,
    Ended,
    Rejected,
    Missed,
}

impl CallStatus {
    /// Terminal statuses have no live session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Rejected | CallStatus::Missed)
    }
}

/// One callee leg of a call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallParticipant {
    pub user_id: UserId,
    pub status: ParticipantStatus,
    pub joined_at: Option<DateTime<Utc>>,
    pub left_at: Option<DateTime<Utc>>,
}

impl CallParticipant {
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, status: ParticipantStatus) -> Self {
        Self {
            user_id: user_id.into(),
            status,
            joined_at: None,
            left_at: None,
        }
    }
}

/// A persisted call record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub conversation_id: Option<ConversationId>,
    pub caller_id: UserId,
    pub participants: Vec<CallParticipant>,
    pub kind: CallKind,
    pub is_group: bool,
    pub status: CallStatus,
    pub room_id: RoomId,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: u64,
}

impl Call {
    /// Create a call in the `Ringing` state with a fresh room id.
    #[must_use]
    pub fn new(
        id: impl Into<CallId>,
        caller_id: impl Into<UserId>,
        participants: Vec<CallParticipant>,
        kind: CallKind,
        is_group: bool,
        conversation_id: Option<ConversationId>,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id,
            caller_id: caller_id.into(),
            participants,
            kind,
            is_group,
            status: CallStatus::Ringing,
            room_id: format!("room_{}", uuid::Uuid::new_v4()),
            started_at: None,
            ended_at: None,
            duration_secs: 0,
        }
    }

    #[must_use]
    pub fn participant(&self, user_id: &str) -> Option<&CallParticipant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut CallParticipant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    /// True when every leg has been rejected.
    #[must_use]
    pub fn all_rejected(&self) -> bool {
        !self.participants.is_empty()
            && self
                .participants
                .iter()
                .all(|p| p.status == ParticipantStatus::Rejected)
    }

    /// Move the call to a terminal status, stamping `ended_at`, filling
    /// missing `left_at` entries, and computing the duration.
    ///
    /// The duration is computed here, at persistence time, and saturates at
    /// zero so it can never be negative.
    pub fn finish(&mut self, status: CallStatus, now: DateTime<Utc>) {
        self.status = status;
        self.ended_at = Some(now);
        for p in &mut self.participants {
            if p.left_at.is_none() {
                p.left_at = Some(now);
            }
        }
        self.duration_secs = match self.started_at {
            Some(started) => (now - started).num_seconds().max(0) as u64,
            None => 0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_message_status_monotonic() {
        let mut msg = Message::new("c1", "alice", "hi", MessageKind::Text, None);
        assert_eq!(msg.status, MessageStatus::Sent);

        msg.promote(MessageStatus::Read);
        assert_eq!(msg.status, MessageStatus::Read);

        // Regression is a no-op
        msg.promote(MessageStatus::Delivered);
        assert_eq!(msg.status, MessageStatus::Read);
        msg.promote(MessageStatus::Sent);
        assert_eq!(msg.status, MessageStatus::Read);
    }

    #[test]
    fn test_conversation_recipients() {
        let conv = Conversation::new_group("g1", vec!["a".into(), "b".into(), "c".into()]);
        assert_eq!(conv.recipients("a"), vec!["b".to_string(), "c".to_string()]);
        assert!(conv.is_participant("b"));
        assert!(!conv.is_participant("d"));
    }

    #[test]
    fn test_call_duration_never_negative() {
        let now = Utc::now();
        let mut call = Call::new(
            "call-1",
            "alice",
            vec![CallParticipant::new("bob", ParticipantStatus::Pending)],
            CallKind::Audio,
            false,
            None,
        );

        // Skewed clock: started after "now"
        call.started_at = Some(now + Duration::seconds(5));
        call.finish(CallStatus::Ended, now);
        assert_eq!(call.duration_secs, 0);
        assert!(call.ended_at.is_some());
        assert!(call.participants.iter().all(|p| p.left_at.is_some()));
    }

    #[test]
    fn test_call_duration() {
        let now = Utc::now();
        let mut call = Call::new(
            "call-1",
            "alice",
            vec![CallParticipant::new("bob", ParticipantStatus::Accepted)],
            CallKind::Video,
            false,
            None,
        );
        call.started_at = Some(now - Duration::seconds(90));
        call.finish(CallStatus::Ended, now);
        assert_eq!(call.duration_secs, 90);
    }

    #[test]
    fn test_all_rejected() {
        let mut call = Call::new(
            "call-1",
            "alice",
            vec![
                CallParticipant::new("bob", ParticipantStatus::Pending),
                CallParticipant::new("carol", ParticipantStatus::Rejected),
            ],
            CallKind::Audio,
            true,
            Some("g1".into()),
        );
        assert!(!call.all_rejected());
        call.participant_mut("bob").unwrap().status = ParticipantStatus::Rejected;
        assert!(call.all_rejected());
    }
}
