//! # groupcast-core
//!
//! Foundation types shared by every groupcast crate:
//!
//! - **Branded IDs**: `ConnectionId`, `SessionId`, `UserId` as newtypes for type safety
//! - **Messages**: [`Message`] parsed from inbound JSON payloads, plus [`Params`]
//!   for named captures
//! - **Errors**: [`MessageError`] via `thiserror`
//! - **Logging**: `tracing` subscriber setup and in-memory capture for tests

#![deny(unsafe_code)]

pub mod errors;
pub mod ids;
pub mod logging;
pub mod message;

pub use errors::MessageError;
pub use ids::{ConnectionId, SessionId, UserId};
pub use message::{Message, Params};
