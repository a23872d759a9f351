// src/core/dispatch.rs

//! The outbound send path.

use crate::core::RealtimeError;
use crate::core::connection::ConnectionManager;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

const CONTENT_TYPE_JSON: &str = "application/json";
const CONTENT_TYPE_TEXT: &str = "text/plain";

/// An application message body. Strings go on the wire untouched; structured
/// values are serialized to JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundBody {
    Text(String),
    Json(Value),
}

impl OutboundBody {
    /// Returns the wire bytes and their content type.
    pub fn into_wire(self) -> Result<(Bytes, &'static str), RealtimeError> {
        match self {
            OutboundBody::Text(text) => Ok((Bytes::from(text), CONTENT_TYPE_TEXT)),
            OutboundBody::Json(value) => {
                let encoded = serde_json::to_vec(&value)?;
                Ok((Bytes::from(encoded), CONTENT_TYPE_JSON))
            }
        }
    }
}

impl From<&str> for OutboundBody {
    fn from(text: &str) -> Self {
        OutboundBody::Text(text.to_string())
    }
}

impl From<String> for OutboundBody {
    fn from(text: String) -> Self {
        OutboundBody::Text(text)
    }
}

impl From<Value> for OutboundBody {
    fn from(value: Value) -> Self {
        OutboundBody::Json(value)
    }
}

/// Publishes messages over the manager's connection, connecting on demand.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    manager: ConnectionManager,
}

impl Dispatcher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Sends `body` to `destination` and resolves once the frame is written.
    /// Connection failures surface exactly as `connect()` reports them; a failed
    /// write is reported as `PublishFailed` and not retried.
    pub async fn send(
        &self,
        destination: &str,
        body: impl Into<OutboundBody>,
    ) -> Result<(), RealtimeError> {
        let (payload, content_type) = body.into().into_wire()?;
        let connection = self.manager.connect().await?;
        debug!(
            "Publishing {} byte(s) to '{}' on connection #{}.",
            payload.len(),
            destination,
            connection.id()
        );
        connection
            .publish(destination, payload, content_type)
            .await
    }

    /// Serializes any `Serialize` value as JSON and sends it.
    pub async fn send_json<T: Serialize + ?Sized>(
        &self,
        destination: &str,
        value: &T,
    ) -> Result<(), RealtimeError> {
        let value = serde_json::to_value(value)?;
        self.send(destination, OutboundBody::Json(value)).await
    }
}
