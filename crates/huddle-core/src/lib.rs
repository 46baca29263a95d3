//! # huddle-core
//!
//! Presence tracking, conversation fan-out, message delivery, and call
//! session management for the Huddle realtime messaging server.
//!
//! This crate provides the coordination layer:
//!
//! - **Presence** - user-to-connection routing with supersede semantics
//! - **Rooms** - broadcast fan-out groups for conversations and call rooms
//! - **Pipeline** - message persistence with delivery/read receipts
//! - **Calls** - the call state machine with busy detection
//! - **Relay** - verbatim WebRTC signal forwarding
//! - **Store** - the persistence collaborator trait
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Pipeline   │────▶│    Rooms    │
//! └─────────────┘     │  Calls      │     └─────────────┘
//!                     │  Relay      │────▶┌─────────────┐
//!                     └──────┬──────┘     │  Presence   │
//!                            ▼            └─────────────┘
//!                     ┌─────────────┐
//!                     │    Store    │
//!                     └─────────────┘
//! ```

pub mod calls;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod presence;
pub mod relay;
pub mod rooms;
pub mod store;
pub mod types;

pub use calls::{CallManager, InitiateRequest};
pub use error::CoreError;
pub use memory::MemoryStore;
pub use pipeline::MessagePipeline;
pub use presence::{EventSender, PresenceRegistry};
pub use relay::SignalRelay;
pub use rooms::{call_room, conversation_room, RoomRegistry, RoomsConfig};
pub use store::{Store, StoreError};
pub use types::{
    Call, CallParticipant, CallStatus, Conversation, Message, ParticipantStatus, Receipt,
    UserProfile,
};
