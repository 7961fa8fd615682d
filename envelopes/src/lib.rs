//! Shared wire schema and JSON codec for the widget push channel.
//!
//! This crate owns the representation of everything that crosses the
//! `/widget/ws` socket: outbound [`Directive`]s from the widget and inbound
//! [`Envelope`]s from the backend. The polling endpoint returns the same
//! [`ChatMessage`] payloads, so both delivery modes share one schema.
//!
//! DESIGN
//! ======
//! Envelopes are adjacently tagged (`{ "event": ..., "payload": ... }`) and
//! directives internally tagged (`{ "type": ..., ... }`). Message payloads keep
//! unknown fields in `extra` so backend additions survive a round trip through
//! the widget untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Error returned by the encode and decode functions.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode frame: {0}")]
    Encode(serde_json::Error),
    /// The text was not valid JSON or did not match the envelope schema.
    #[error("failed to decode envelope: {0}")]
    Decode(#[from] serde_json::Error),
    /// The envelope carried an event discriminator this crate does not know.
    #[error("unknown envelope event: {0}")]
    UnknownEvent(String),
}

/// Who authored a chat message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    #[default]
    Visitor,
    /// A business-side user answering the visitor.
    Agent,
    System,
    /// Any sender kind added by the backend after this crate was built.
    #[serde(other)]
    Other,
}

/// A single conversation message.
///
/// The transport only routes on `conversation_id` and tracks `id` as the
/// polling cursor; every other field is carried for the presentation layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Opaque, backend-assigned.
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    #[serde(default)]
    pub sender_type: SenderType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    /// RFC 3339 creation timestamp as sent by the backend.
    pub created_at: String,
    /// Fields this crate does not model.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Ephemeral "is typing" notice for a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingIndicator {
    pub conversation_id: String,
    /// Display name of whoever is typing.
    #[serde(default)]
    pub name: String,
    pub is_typing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// Read receipt for a conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_message_id: Option<String>,
}

/// Inbound event from the push channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    NewMessage(ChatMessage),
    Typing(TypingIndicator),
    Read(ReadReceipt),
}

impl Envelope {
    /// Conversation this envelope is addressed to.
    #[must_use]
    pub fn conversation_id(&self) -> &str {
        match self {
            Self::NewMessage(message) => &message.conversation_id,
            Self::Typing(indicator) => &indicator.conversation_id,
            Self::Read(receipt) => &receipt.conversation_id,
        }
    }

    /// Wire discriminator for this envelope.
    #[must_use]
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new_message",
            Self::Typing(_) => "typing",
            Self::Read(_) => "read",
        }
    }
}

/// Outbound instruction sent by the widget over the push channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    /// Start receiving events for a conversation.
    #[serde(rename_all = "camelCase")]
    Subscribe { conversation_id: String },
    /// Tell the other side the visitor is (or stopped) typing.
    #[serde(rename_all = "camelCase")]
    Typing { conversation_id: String, is_typing: bool },
}

impl Directive {
    pub fn subscribe(conversation_id: impl Into<String>) -> Self {
        Self::Subscribe { conversation_id: conversation_id.into() }
    }

    pub fn typing(conversation_id: impl Into<String>, is_typing: bool) -> Self {
        Self::Typing { conversation_id: conversation_id.into(), is_typing }
    }
}

/// Encode a directive as a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_directive(directive: &Directive) -> Result<String, CodecError> {
    serde_json::to_string(directive).map_err(CodecError::Encode)
}

/// Decode a JSON text frame into a directive.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed text.
pub fn decode_directive(text: &str) -> Result<Directive, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode an envelope as a JSON text frame.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] if serialization fails.
pub fn encode_envelope(envelope: &Envelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(CodecError::Encode)
}

/// Decode a JSON text frame into an envelope.
///
/// # Errors
///
/// Returns [`CodecError::UnknownEvent`] when the `event` discriminator is not
/// one of `new_message`, `typing`, `read`, and [`CodecError::Decode`] for any
/// other malformed input.
pub fn decode_envelope(text: &str) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    if let Some(event) = value.get("event").and_then(Value::as_str)
        && !matches!(event, "new_message" | "typing" | "read")
    {
        return Err(CodecError::UnknownEvent(event.to_owned()));
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
