//! Message payloads and delivery metadata
//!
//! Defines the payload sum type used on both the publish and consume paths
//! and the per-delivery metadata handed to message handlers.

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;

/// A message payload, either plain text or a structured JSON document.
///
/// Publishing serializes `Json` payloads to their wire form; consuming with
/// JSON parsing enabled produces `Json`, otherwise `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Plain UTF-8 text
    Text(String),
    /// Structured JSON document
    Json(Value),
}

impl Payload {
    /// Build a JSON payload from any serializable value
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    /// Serialize the payload for the wire
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            Payload::Text(text) => Ok(Bytes::from(text)),
            Payload::Json(value) => Ok(Bytes::from(serde_json::to_vec(&value)?)),
        }
    }

    /// Text content, if this is a text payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Text(text) => Some(text),
            Payload::Json(_) => None,
        }
    }

    /// JSON content, if this is a structured payload
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Text(_) => None,
            Payload::Json(value) => Some(value),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Subset of broker message properties carried with each delivery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// MIME content type (e.g. "application/json")
    pub content_type: Option<String>,
    /// Identifier of the publishing application
    pub app_id: Option<String>,
}

/// Broker-assigned metadata for one inbound delivery.
///
/// Owned by the dispatch call for its duration; never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMetadata {
    /// Broker-assigned delivery identifier, used for acknowledgment
    pub delivery_tag: u64,
    /// True when the broker redelivered this message
    pub redelivered: bool,
    /// Exchange the message arrived through
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Properties set by the publisher
    pub properties: MessageProperties,
}

/// One inbound delivery as produced by a transport backend
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Delivery metadata
    pub metadata: MessageMetadata,
    /// Raw message body
    pub body: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_text_payload_bytes() {
        let payload = Payload::from("hello");
        assert_eq!(payload.as_str(), Some("hello"));
        assert_eq!(payload.into_bytes().unwrap(), Bytes::from("hello"));
    }

    #[test]
    fn test_json_payload_serializes() {
        let payload = Payload::from(json!({"a": 1}));
        let bytes = payload.into_bytes().unwrap();

        let parsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, json!({"a": 1}));
    }

    #[test]
    fn test_json_constructor() {
        #[derive(Serialize)]
        struct Reading {
            sensor: String,
            value: i32,
        }

        let payload = Payload::json(&Reading {
            sensor: "temp".to_string(),
            value: 25,
        })
        .unwrap();

        assert_eq!(payload.as_json(), Some(&json!({"sensor": "temp", "value": 25})));
    }
}
