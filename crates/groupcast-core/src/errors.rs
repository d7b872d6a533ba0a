//! Core error types.

use thiserror::Error;

/// Errors raised while decoding an inbound payload into a [`Message`].
///
/// [`Message`]: crate::message::Message
#[derive(Debug, Error)]
pub enum MessageError {
    /// The payload was not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),
    /// The payload was not valid JSON.
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    /// The payload was valid JSON but not an object.
    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
