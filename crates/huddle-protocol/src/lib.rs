//! # huddle-protocol
//!
//! Wire protocol definitions for the Huddle realtime messaging server.
//!
//! This crate defines the events exchanged between Huddle clients and
//! servers over a persistent bidirectional connection, plus the binary
//! codec used to frame them.
//!
//! ## Event Families
//!
//! - `SendMessage` / `MessagesRead` / typing - conversation traffic
//! - `CallUser` / `AnswerCall` / `RejectCall` / `EndCall` - call lifecycle
//! - `IceCandidate` / `GroupCallSignal` - verbatim WebRTC signaling relay
//! - `JoinConversation` / `JoinCallRoom` - fan-out group membership
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, ClientEvent};
//!
//! let event = ClientEvent::TypingStart {
//!     conversation_id: "conv-1".into(),
//! };
//!
//! let encoded = codec::encode(&event).unwrap();
//! let decoded: ClientEvent = codec::decode(&encoded).unwrap();
//! assert_eq!(event, decoded);
//! ```

pub mod codec;
pub mod events;

pub use codec::{decode, encode, ProtocolError};
pub use events::{
    codes, CallKind, ClientEvent, MessageEvent, MessageKind, MessageStatus, ServerEvent,
};
