//! Error taxonomy for the coordination layer.

use crate::store::StoreError;
use huddle_protocol::codes;
use thiserror::Error;

/// Core errors.
///
/// Routing misses (offline targets, busy callees) are deliberately not
/// errors: they are outcomes signaled via `user-unavailable`/`user-busy`
/// events while the operation completes normally.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Sender is not a participant of the target conversation.
    #[error("Not a participant of conversation: {0}")]
    Unauthorized(String),

    /// Actor is not a party to the call.
    #[error("Not a party to call: {0}")]
    Forbidden(String),

    /// Unknown conversation, call, or target user.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Durable-store failure on a primary write.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

impl CoreError {
    /// Map this error to its wire error code.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            CoreError::Unauthorized(_) => codes::UNAUTHORIZED,
            CoreError::Forbidden(_) => codes::FORBIDDEN,
            CoreError::NotFound(_) => codes::NOT_FOUND,
            CoreError::Store(_) => codes::STORAGE,
        }
    }
}
