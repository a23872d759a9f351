// src/core/pubsub/message.rs

//! The shape in which inbound MESSAGE frames reach listeners.

use crate::core::RealtimeError;
use crate::core::protocol::StompFrame;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;

/// A message body. Bodies that parse as JSON are delivered structured; anything
/// else is passed through as text rather than dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Raw(String),
}

impl Payload {
    pub fn parse(body: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(String::from_utf8_lossy(body).into_owned()),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Payload::Json(value) => Some(value),
            Payload::Raw(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Payload::Json(_) => None,
            Payload::Raw(text) => Some(text),
        }
    }

    /// Deserializes the payload into a caller-defined type.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, RealtimeError> {
        match self {
            Payload::Json(value) => Ok(T::deserialize(value)?),
            Payload::Raw(text) => Ok(serde_json::from_str(text)?),
        }
    }
}

impl fmt::Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Json(value) => write!(f, "{value}"),
            Payload::Raw(text) => f.write_str(text),
        }
    }
}

/// A message delivered on a subscribed topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// The topic the listener subscribed to.
    pub topic: String,
    /// The `destination` header as sent by the server, which may differ from
    /// `topic` for brokers that rewrite destinations.
    pub destination: Option<String>,
    pub message_id: Option<String>,
    pub headers: Vec<(String, String)>,
    pub payload: Payload,
}

impl InboundMessage {
    pub(crate) fn from_frame(topic: &str, frame: &StompFrame) -> Self {
        Self {
            topic: topic.to_string(),
            destination: frame.get_header("destination").map(str::to_string),
            message_id: frame.get_header("message-id").map(str::to_string),
            headers: frame.headers.clone(),
            payload: Payload::parse(&frame.body),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}
