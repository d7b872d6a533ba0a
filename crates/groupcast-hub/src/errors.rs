//! Hub error types.
//!
//! Errors fall in two camps. Programmer misuse (duplicate connection IDs, bad
//! patterns, templates that reference parameters no route captures) surfaces
//! immediately as [`HubError`]. Runtime delivery problems ([`DeliveryFailure`])
//! and handler failures ([`HandlerError`]) are logged and absorbed.
//! [`Rejection`] is not an error at all: it is how a connect stage or
//! `on_connect` declines a connection.

use std::fmt;
use std::time::Duration;

use groupcast_core::ConnectionId;
use thiserror::Error;

/// Errors surfaced to the caller of a hub operation.
#[derive(Debug, Error)]
pub enum HubError {
    /// A connection with this ID is already registered (transport bug).
    #[error("connection '{id}' is already registered")]
    DuplicateConnection {
        /// The duplicated connection ID.
        id: ConnectionId,
    },

    /// Two mounted consumers share a name.
    #[error("consumer '{name}' is mounted twice")]
    DuplicateConsumer {
        /// The duplicated consumer name.
        name: String,
    },

    /// A group name template is malformed or needs a parameter that no
    /// pattern can capture.
    #[error("malformed group name template '{template}': {reason}")]
    MalformedGroupNameTemplate {
        /// The offending template.
        template: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A regex pattern failed to compile.
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The pattern source.
        pattern: String,
        /// Compilation error.
        #[source]
        source: regex::Error,
    },

    /// A group name contains forbidden characters or has a bad length.
    #[error("invalid group name '{name}': {reason}")]
    InvalidGroupName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// Hub settings failed validation.
    #[error(transparent)]
    Settings(#[from] groupcast_settings::SettingsError),
}

impl HubError {
    /// Shorthand for [`HubError::MalformedGroupNameTemplate`].
    pub fn malformed_template(template: &str, reason: impl Into<String>) -> Self {
        Self::MalformedGroupNameTemplate {
            template: template.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Why a single delivery did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryFailure {
    /// The transport reported the connection closed or its queue full.
    #[error("transport refused the payload")]
    Rejected,
    /// The transport did not accept the payload within the send timeout.
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

impl DeliveryFailure {
    /// Short label used for metrics.
    pub fn kind(self) -> &'static str {
        match self {
            Self::Rejected => "rejected",
            Self::TimedOut(_) => "timeout",
        }
    }
}

/// Failure returned by a message handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A required field was missing or had the wrong type.
    #[error("bad request: {0}")]
    BadRequest(String),
    /// A hub operation inside the handler failed.
    #[error(transparent)]
    Hub(#[from] HubError),
    /// Serializing an outbound payload failed.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
    /// The handler did not finish within the handler timeout.
    #[error("handler timed out after {0:?}")]
    TimedOut(Duration),
    /// Anything else.
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Hub(_) => "hub",
            Self::Encode(_) => "encode",
            Self::TimedOut(_) => "timeout",
            Self::Other(_) => "other",
        }
    }
}

/// A connect stage, `on_connect`, or receive stage declined to proceed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Human-readable reason, logged by the hub.
    pub reason: String,
}

impl Rejection {
    /// Create a rejection with a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}
