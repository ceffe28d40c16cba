// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages, Payloads and Reserved Headers
//!
//! A [`Message`] is what a consumer receives and what the forwarding publisher re-sends.
//! [`Payload`] is what applications publish; it decides the content type. [`Content`] is
//! the decoded form handed to subscription handlers.
//!
//! Metadata owned by this crate lives in a single nested header table named
//! [`HEADER_NAMESPACE`] so it never collides with application headers.

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use serde::Serialize;
use tracing::error;

/// Content type of JSON payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type of text payloads
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type of raw and encrypted payloads
pub const BINARY_CONTENT_TYPE: &str = "application/octet-stream";

/// Header table holding encryption and forwarding metadata
pub const HEADER_NAMESPACE: &str = "x-warren";
/// Encryption metadata table inside the namespace
pub const HEADER_ENCRYPTION: &str = "encryption";
/// Queue the message was consumed from before being forwarded
pub const HEADER_ORIGINAL_QUEUE: &str = "originalQueue";
/// Exchange the message was published to before being forwarded
pub const HEADER_ORIGINAL_EXCHANGE: &str = "originalExchange";
/// Routing key the message was published with before being forwarded
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "originalRoutingKey";
/// Whether a later hop should reapply the original routing key
pub const HEADER_RESTORE_ROUTING_HEADERS: &str = "restoreRoutingHeaders";

/// A message delivered by the broker.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub id: String,
    pub content_type: Option<String>,
    pub headers: FieldTable,
    pub payload: Vec<u8>,
    /// Tag of the consumer that delivered the message; the session key for ack/nack.
    pub consumer_tag: String,
    /// Per-channel delivery number.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub queue: String,
    pub redelivered: bool,
}

impl Message {
    /// Looks up a field of the reserved header namespace.
    pub fn namespace_field(&self, key: &str) -> Option<&AMQPValue> {
        namespace_field(&self.headers, key)
    }
}

/// Application data to publish.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Payload {
    /// Serializes any value into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> Result<Payload, AmqpError> {
        serde_json::to_value(value).map(Payload::Json).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })
    }

    /// Returns the wire bytes and the default content type of this payload.
    pub(crate) fn encode(&self) -> Result<(Vec<u8>, &'static str), AmqpError> {
        match self {
            Payload::Text(text) => Ok((text.as_bytes().to_vec(), TEXT_CONTENT_TYPE)),
            Payload::Bytes(bytes) => Ok((bytes.clone(), BINARY_CONTENT_TYPE)),
            Payload::Json(value) => serde_json::to_vec(value)
                .map(|body| (body, JSON_CONTENT_TYPE))
                .map_err(|err| {
                    error!(error = err.to_string(), "failure to encode payload");
                    AmqpError::ParsePayloadError
                }),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Payload::Text(value.to_owned())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Payload::Text(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::Bytes(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::Bytes(value.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Json(value)
    }
}

/// Decoded message content handed to subscription handlers.
#[derive(Debug, Clone, PartialEq)]
pub enum Content {
    Text(String),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl Content {
    /// Decodes `payload` according to its content type.
    ///
    /// JSON that fails to parse is an error; every other content type decodes.
    pub fn decode(content_type: Option<&str>, payload: &[u8]) -> Result<Content, AmqpError> {
        match content_type {
            Some(ct) if ct == JSON_CONTENT_TYPE => serde_json::from_slice(payload)
                .map(Content::Json)
                .map_err(|err| {
                    error!(error = err.to_string(), "failure to parse json content");
                    AmqpError::ParsePayloadError
                }),
            Some(ct) if ct.starts_with("text/") => {
                Ok(Content::Text(String::from_utf8_lossy(payload).into_owned()))
            }
            _ => Ok(Content::Bytes(payload.to_vec())),
        }
    }
}

pub(crate) fn namespace_field<'h>(headers: &'h FieldTable, key: &str) -> Option<&'h AMQPValue> {
    headers
        .inner()
        .get(HEADER_NAMESPACE)
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(key))
}

pub(crate) fn set_namespace_field(headers: &mut FieldTable, key: &str, value: AMQPValue) {
    let mut table = headers
        .inner()
        .get(HEADER_NAMESPACE)
        .and_then(|value| value.as_field_table())
        .cloned()
        .unwrap_or_default();

    table.insert(ShortString::from(key), value);
    headers.insert(
        ShortString::from(HEADER_NAMESPACE),
        AMQPValue::FieldTable(table),
    );
}

pub(crate) fn long_string(value: &str) -> AMQPValue {
    AMQPValue::LongString(LongString::from(value))
}

/// Reads a string header value regardless of whether it was sent as a short or long string.
pub(crate) fn as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => Some(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_is_plain() {
        let (body, content_type) = Payload::from("test message").encode().unwrap();
        assert_eq!(content_type, TEXT_CONTENT_TYPE);
        assert_eq!(body, b"test message");
    }

    #[test]
    fn bytes_are_octet_stream() {
        let (body, content_type) = Payload::from(b"test message".to_vec()).encode().unwrap();
        assert_eq!(content_type, BINARY_CONTENT_TYPE);
        assert_eq!(body, b"test message");
    }

    #[test]
    fn values_are_canonical_json() {
        #[derive(Serialize)]
        struct Body {
            message: &'static str,
        }

        let payload = Payload::json(&Body {
            message: "test message",
        })
        .unwrap();
        let (body, content_type) = payload.encode().unwrap();
        assert_eq!(content_type, JSON_CONTENT_TYPE);
        assert_eq!(body, br#"{"message":"test message"}"#);
    }

    #[test]
    fn decodes_by_content_type() {
        assert_eq!(
            Content::decode(Some(JSON_CONTENT_TYPE), br#"{"a":1}"#).unwrap(),
            Content::Json(json!({ "a": 1 }))
        );
        assert_eq!(
            Content::decode(Some("text/plain"), b"hello").unwrap(),
            Content::Text("hello".to_owned())
        );
        assert_eq!(
            Content::decode(None, b"hello").unwrap(),
            Content::Bytes(b"hello".to_vec())
        );
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert_eq!(
            Content::decode(Some(JSON_CONTENT_TYPE), b"{nope"),
            Err(AmqpError::ParsePayloadError)
        );
    }

    #[test]
    fn namespace_fields_do_not_clobber_each_other() {
        let mut headers = FieldTable::default();
        set_namespace_field(&mut headers, HEADER_ORIGINAL_QUEUE, long_string("q1"));
        set_namespace_field(&mut headers, HEADER_ORIGINAL_ROUTING_KEY, long_string("rk1"));

        assert_eq!(
            namespace_field(&headers, HEADER_ORIGINAL_QUEUE).and_then(as_string),
            Some("q1".to_owned())
        );
        assert_eq!(
            namespace_field(&headers, HEADER_ORIGINAL_ROUTING_KEY).and_then(as_string),
            Some("rk1".to_owned())
        );
    }
}
