//! Inbound message model.
//!
//! Transports hand the hub raw bytes. Those bytes must decode to a JSON object;
//! the optional `"command"` key selects which route handles the message and the
//! remaining keys are available to field patterns and handlers.

use std::borrow::Cow;
use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::errors::MessageError;

/// Named captures collected while matching a connection path or a message.
pub type Params = BTreeMap<String, String>;

/// Key holding the command name in an inbound message.
pub const COMMAND_KEY: &str = "command";

/// A decoded inbound message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Message {
    content: Map<String, Value>,
}

impl Message {
    /// Decode a raw payload. The payload must be a UTF-8 JSON object.
    pub fn parse(raw: &[u8]) -> Result<Self, MessageError> {
        let text = std::str::from_utf8(raw)?;
        match serde_json::from_str::<Value>(text)? {
            Value::Object(content) => Ok(Self { content }),
            Value::Array(_) => Err(MessageError::NotAnObject("array")),
            Value::String(_) => Err(MessageError::NotAnObject("string")),
            Value::Number(_) => Err(MessageError::NotAnObject("number")),
            Value::Bool(_) => Err(MessageError::NotAnObject("boolean")),
            Value::Null => Err(MessageError::NotAnObject("null")),
        }
    }

    /// Build a message from already-decoded content.
    #[must_use]
    pub fn from_content(content: Map<String, Value>) -> Self {
        Self { content }
    }

    /// The command name, if the message carries a string `"command"` key.
    pub fn command(&self) -> Option<&str> {
        self.content.get(COMMAND_KEY).and_then(Value::as_str)
    }

    /// Raw access to a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }

    /// A field rendered as text for pattern matching.
    ///
    /// Strings are returned as-is; numbers and booleans use their JSON
    /// rendering. Objects, arrays and `null` have no text form.
    pub fn text(&self, key: &str) -> Option<Cow<'_, str>> {
        match self.content.get(key)? {
            Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            Value::Number(n) => Some(Cow::Owned(n.to_string())),
            Value::Bool(b) => Some(Cow::Owned(b.to_string())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// The full decoded content.
    pub fn content(&self) -> &Map<String, Value> {
        &self.content
    }

    /// Serialize the content back to JSON bytes.
    pub fn to_json_bytes(&self) -> Vec<u8> {
        // A `Map<String, Value>` always serializes.
        serde_json::to_vec(&self.content).unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
