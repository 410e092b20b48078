//! Command envelope exchanged between endpoints and its wire codec.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::Context;

/// Asks the counterpart to reply with its full current context.
pub const REQUEST_CURRENT_CONTEXT: &str = "request-current-context";

/// Carries a full or partial context to be merged by the counterpart.
pub const SEND_CURRENT_CONTEXT: &str = "send-current-context";

/// Default upper bound for an encoded message, in bytes.
pub const DEFAULT_MAX_WIRE_BYTES: usize = 64 * 1024;

/// Flat key/value form handed to transport adapters.
pub type WireMessage = Map<String, Value>;

/// Codec error.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Message has no command")]
    MissingCommand,
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Payload must serialize to a key/value object")]
    PayloadNotObject,
    #[error("Encoded message is {size} bytes, limit is {limit}")]
    TooLarge { size: usize, limit: usize },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A command plus optional payload. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Context>,
}

impl Message {
    /// Create a message.
    #[must_use]
    pub fn new(command: impl Into<String>, payload: Option<Context>) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }

    /// Create a message without payload.
    #[must_use]
    pub fn command(command: impl Into<String>) -> Self {
        Self::new(command, None)
    }

    /// Create a message whose payload is any serializable value.
    ///
    /// # Errors
    /// Returns error if the value does not serialize to a key/value object.
    pub fn with_serialized<T: Serialize>(
        command: impl Into<String>,
        payload: &T,
    ) -> Result<Self, CodecError> {
        match serde_json::to_value(payload)? {
            Value::Object(map) => Ok(Self::new(command, Some(map))),
            Value::Null => Ok(Self::new(command, None)),
            _ => Err(CodecError::PayloadNotObject),
        }
    }

    /// The `request-current-context` protocol message.
    #[must_use]
    pub fn request_current_context() -> Self {
        Self::command(REQUEST_CURRENT_CONTEXT)
    }

    /// The `send-current-context` protocol message.
    #[must_use]
    pub fn send_current_context(context: Context) -> Self {
        Self::new(SEND_CURRENT_CONTEXT, Some(context))
    }

    /// Command identifier.
    #[must_use]
    pub fn command_name(&self) -> &str {
        &self.command
    }

    /// Payload, if any.
    #[must_use]
    pub const fn payload(&self) -> Option<&Context> {
        self.payload.as_ref()
    }

    /// Consume the message, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Option<Context> {
        self.payload
    }

    /// Whether this message uses one of the reserved protocol commands.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        matches!(
            self.command.as_str(),
            REQUEST_CURRENT_CONTEXT | SEND_CURRENT_CONTEXT
        )
    }
}

/// Converts messages to and from `WireMessage`.
#[derive(Debug, Clone, Copy)]
pub struct MessageCodec {
    max_wire_bytes: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WIRE_BYTES)
    }
}

impl MessageCodec {
    /// Create a codec enforcing the given encoded size limit.
    #[must_use]
    pub const fn new(max_wire_bytes: usize) -> Self {
        Self { max_wire_bytes }
    }

    /// Encode a message.
    ///
    /// # Errors
    /// Returns error if the message cannot be represented or exceeds the size limit.
    pub fn encode(&self, message: &Message) -> Result<WireMessage, CodecError> {
        let size = serde_json::to_vec(message)?.len();
        if size > self.max_wire_bytes {
            return Err(CodecError::TooLarge {
                size,
                limit: self.max_wire_bytes,
            });
        }

        match serde_json::to_value(message)? {
            Value::Object(map) => Ok(map),
            _ => Err(CodecError::Malformed("message is not an object".to_string())),
        }
    }

    /// Decode a message. Unknown top-level keys are ignored.
    ///
    /// # Errors
    /// Returns error if `command` is missing or the payload is not an object.
    pub fn decode(&self, wire: &WireMessage) -> Result<Message, CodecError> {
        if !wire.contains_key("command") {
            return Err(CodecError::MissingCommand);
        }
        for key in wire.keys().filter(|k| !matches!(k.as_str(), "command" | "payload")) {
            tracing::trace!(key = key.as_str(), "ignoring unknown message key");
        }
        serde_json::from_value(Value::Object(wire.clone()))
            .map_err(|e| CodecError::Malformed(e.to_string()))
    }
}
