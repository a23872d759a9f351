// src/core/transport/websocket.rs

//! STOMP over WebSocket, one frame (or heart-beat) per WebSocket message.

use super::{Connector, HandshakeRequest, TransportLink};
use crate::core::RealtimeError;
use crate::core::protocol::{StompFrameCodec, StompItem};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// STOMP sub-protocols offered during the upgrade.
const STOMP_SUBPROTOCOLS: &str = "v12.stomp, v11.stomp, v10.stomp";

/// Opens WebSocket links with a bounded upgrade time.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    upgrade_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(upgrade_timeout: Duration) -> Self {
        Self { upgrade_timeout }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn open(&self, request: HandshakeRequest) -> Result<Box<dyn TransportLink>, RealtimeError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::HandshakeFailed(format!("invalid WebSocket request: {e}")))?;

        let headers = ws_request.headers_mut();
        headers.insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(STOMP_SUBPROTOCOLS),
        );
        for (name, value) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                RealtimeError::HandshakeFailed(format!("invalid header name '{name}': {e}"))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                RealtimeError::HandshakeFailed(format!("invalid value for header '{name}': {e}"))
            })?;
            headers.insert(name, value);
        }

        let (ws, response) =
            match tokio::time::timeout(self.upgrade_timeout, connect_async(ws_request)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => {
                    return Err(RealtimeError::HandshakeFailed(format!(
                        "WebSocket upgrade to {} failed: {e}",
                        request.url
                    )));
                }
                Err(_) => {
                    return Err(RealtimeError::HandshakeFailed(format!(
                        "WebSocket upgrade to {} timed out after {:?}",
                        request.url, self.upgrade_timeout
                    )));
                }
            };
        debug!(
            "WebSocket upgrade to {} complete (status {}).",
            request.url,
            response.status()
        );

        Ok(Box::new(WebSocketLink {
            ws,
            codec: StompFrameCodec,
            read_buf: BytesMut::with_capacity(4096),
        }))
    }
}

struct WebSocketLink {
    ws: WsStream,
    codec: StompFrameCodec,
    /// Bytes received but not yet decoded into a complete item.
    read_buf: BytesMut,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&mut self, item: StompItem) -> Result<(), RealtimeError> {
        let mut buf = BytesMut::new();
        self.codec.encode(item, &mut buf)?;
        let message = match String::from_utf8(buf.to_vec()) {
            Ok(text) => Message::text(text),
            Err(e) => Message::binary(e.into_bytes()),
        };
        self.ws.send(message).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<StompItem, RealtimeError>> {
        loop {
            match self.codec.decode(&mut self.read_buf) {
                Ok(Some(item)) => return Some(Ok(item)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            match self.ws.next().await? {
                Ok(Message::Text(text)) => self.read_buf.extend_from_slice(text.as_bytes()),
                Ok(Message::Binary(data)) => self.read_buf.extend_from_slice(&data),
                // Control frames still prove the peer is alive.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    return Some(Ok(StompItem::Heartbeat));
                }
                Ok(Message::Close(frame)) => {
                    debug!("WebSocket closed by peer: {:?}", frame);
                    return None;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            debug!("Error while closing WebSocket: {}", e);
        }
    }
}
