// src/core/transport/mod.rs

//! The seam between the STOMP session logic and the byte transport beneath it.
//!
//! The connection manager only ever talks to a [`Connector`] (the transport
//! factory) and the [`TransportLink`]s it produces, so the WebSocket
//! implementation can be swapped for an in-memory one.

use crate::core::RealtimeError;
use crate::core::protocol::StompItem;
use async_trait::async_trait;
use url::Url;

pub mod websocket;

pub use websocket::WebSocketConnector;

/// Everything a transport needs to open a link: the endpoint and the headers
/// for the transport-level handshake (e.g. the WebSocket upgrade request).
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,
}

impl HandshakeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Opens transport links. Invoked once per handshake attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, request: HandshakeRequest) -> Result<Box<dyn TransportLink>, RealtimeError>;
}

/// One open, bidirectional transport session carrying STOMP items.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, item: StompItem) -> Result<(), RealtimeError>;

    /// Waits for the next inbound item. Returns `None` once the peer has closed
    /// the link. Must be cancel-safe: it is raced against outbound traffic.
    async fn recv(&mut self) -> Option<Result<StompItem, RealtimeError>>;

    async fn close(&mut self);
}
