// Inbound bus message envelopes.
//
// Payloads on the bus are UTF-8 JSON objects of one of two shapes:
//   {"type": "...", "payload": {...}}   domain event (appointment/patient updates)
//   {"id": ..., "title": ..., ...}      a notification delivered directly
// The shape is resolved once here so dispatch never re-inspects JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::types::RawNotification;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// A `{type, payload}` domain event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(kind: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self { kind: kind.into(), payload }
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Event(EventEnvelope),
    Direct(RawNotification),
}

impl InboundMessage {
    /// Decode raw bus bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let text = std::str::from_utf8(bytes)?;
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let object = match value {
            Value::Object(object) => object,
            other => return Err(EnvelopeError::NotAnObject(json_type_name(&other))),
        };

        let is_event = matches!(object.get("type"), Some(Value::String(_)))
            && matches!(object.get("payload"), Some(Value::Object(_)));
        if is_event {
            let envelope: EventEnvelope = serde_json::from_value(Value::Object(object))?;
            return Ok(Self::Event(envelope));
        }
        Ok(Self::Direct(object))
    }

    /// The notification object carried by this message, if any.
    ///
    /// Events on notification subjects wrap the notification in `payload`.
    pub fn into_notification(self) -> RawNotification {
        match self {
            Self::Direct(raw) => raw,
            Self::Event(envelope) => envelope.payload,
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
