//! Event types for the Huddle protocol.
//!
//! Two tagged enums cover the whole wire surface: [`ClientEvent`] for
//! inbound client traffic and [`ServerEvent`] for everything the server
//! pushes. Signaling payloads (`signal`, `candidate`) are opaque JSON
//! values relayed verbatim; the server never interprets them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured error codes carried by [`ServerEvent::Error`].
pub mod codes {
    /// Malformed or undecodable event.
    pub const BAD_REQUEST: u16 = 4000;
    /// Sender is not a participant of the target conversation.
    pub const UNAUTHORIZED: u16 = 4001;
    /// Actor is not a party to the call.
    pub const FORBIDDEN: u16 = 4003;
    /// Unknown conversation, call, or target user.
    pub const NOT_FOUND: u16 = 4004;
    /// Durable-store write failed on a primary write.
    pub const STORAGE: u16 = 5000;
}

/// Kind of content a message carries.
///
/// For `Image` and `File` the content field holds a blob-store reference
/// rather than inline text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    File,
}

/// Delivery stage of a message.
///
/// The stored status is the maximum stage reached by any recipient and is
/// monotonic: the `Ord` derivation is what enforcement leans on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Read,
}

/// Audio or video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Audio,
    Video,
}

/// Wire view of a message, carried by [`ServerEvent::NewMessage`].
///
/// Per-recipient receipts stay server-side; only the collapsed status is
/// visible on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Unix timestamp in milliseconds.
    pub sent_at: i64,
}

/// Events sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientEvent {
    /// Submit a message to a conversation.
    SendMessage {
        conversation_id: String,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },

    TypingStart {
        conversation_id: String,
    },

    TypingStop {
        conversation_id: String,
    },

    /// Mark every message in the conversation as read by the sender.
    MessagesRead {
        conversation_id: String,
    },

    /// Initiate a call.
    ///
    /// Private calls name a single target via `user_to_call`; group calls
    /// set `is_group` and derive the callee set from `conversation_id`.
    CallUser {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_to_call: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        #[serde(default)]
        is_group: bool,
        signal_data: Value,
        call_type: CallKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    /// Accept a ringing call, carrying the WebRTC answer for the caller.
    AnswerCall {
        signal: Value,
        to: String,
        call_id: String,
    },

    IceCandidate {
        candidate: Value,
        to: String,
    },

    RejectCall {
        to: String,
        call_id: String,
    },

    EndCall {
        to: String,
        call_id: String,
    },

    /// Client-side busy report, relayed verbatim to the caller.
    UserBusy {
        to: String,
        call_id: String,
    },

    JoinCallRoom {
        room_id: String,
    },

    LeaveCallRoom {
        room_id: String,
    },

    GroupCallSignal {
        room_id: String,
        user_to_signal: String,
        signal: Value,
    },

    GroupCallReturnSignal {
        to: String,
        signal: Value,
    },

    ScreenShareStarted {
        conversation_id: String,
        room_id: String,
    },

    ScreenShareStopped {
        conversation_id: String,
        room_id: String,
    },

    JoinConversation {
        conversation_id: String,
    },

    LeaveConversation {
        conversation_id: String,
    },

    /// Keepalive.
    Ping,
}

/// Events pushed by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Connection established hello.
    Connected {
        user_id: String,
        connection_id: String,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat_ms: u64,
    },

    NewMessage {
        message: MessageEvent,
    },

    MessageStatusUpdate {
        message_id: String,
        conversation_id: String,
        status: MessageStatus,
    },

    UserTyping {
        conversation_id: String,
        user_id: String,
    },

    UserStoppedTyping {
        conversation_id: String,
        user_id: String,
    },

    MessagesRead {
        conversation_id: String,
        user_id: String,
    },

    IncomingCallSignal {
        signal: Value,
        from: String,
        caller_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_avatar: Option<String>,
        call_type: CallKind,
        call_id: String,
        is_group: bool,
        room_id: String,
    },

    CallAccepted {
        signal: Value,
        from: String,
        call_id: String,
    },

    IceCandidate {
        candidate: Value,
        from: String,
    },

    CallRejected {
        from: String,
        call_id: String,
    },

    CallEnded {
        from: String,
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_secs: Option<u64>,
    },

    UserBusy {
        from: String,
        call_id: String,
    },

    /// Routing miss: the target has no live connection.
    UserUnavailable {
        user_id: String,
    },

    UserOnline {
        user_id: String,
    },

    UserOffline {
        user_id: String,
        /// Unix timestamp in milliseconds.
        last_seen: i64,
    },

    UserJoinedCall {
        room_id: String,
        user_id: String,
        user_name: String,
    },

    UserLeftCall {
        room_id: String,
        user_id: String,
        user_name: String,
    },

    GroupCallSignal {
        signal: Value,
        from: String,
        room_id: String,
    },

    GroupCallSignalReturned {
        signal: Value,
        from: String,
    },

    ScreenShareStarted {
        conversation_id: String,
        room_id: String,
        user_id: String,
    },

    ScreenShareStopped {
        conversation_id: String,
        room_id: String,
        user_id: String,
    },

    /// Structured error report to the originating connection.
    Error {
        code: u16,
        message: String,
    },

    /// Keepalive response.
    Pong,
}

impl ServerEvent {
    /// Create a new Error event.
    #[must_use]
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        ServerEvent::Error {
            code,
            message: message.into(),
        }
    }

    /// Create a new UserUnavailable event.
    #[must_use]
    pub fn user_unavailable(user_id: impl Into<String>) -> Self {
        ServerEvent::UserUnavailable {
            user_id: user_id.into(),
        }
    }
}
