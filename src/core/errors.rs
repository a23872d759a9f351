// src/core/errors.rs

//! Defines the primary error type for the realtime client.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing every failure the realtime core can report.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum RealtimeError {
    /// No valid access token could be resolved from the session store.
    #[error("Unauthenticated: no valid access token available")]
    Unauthenticated,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    /// The connection was torn down (by `disconnect` or by the peer) while an
    /// operation was waiting on it.
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Signals the frame decoder that more bytes are needed. Never escapes the codec.
    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// A single handshake result is handed to every waiter, so the error must be cloneable.
impl Clone for RealtimeError {
    fn clone(&self) -> Self {
        match self {
            RealtimeError::Unauthenticated => RealtimeError::Unauthenticated,
            RealtimeError::HandshakeFailed(s) => RealtimeError::HandshakeFailed(s.clone()),
            RealtimeError::SubscriptionFailed(s) => RealtimeError::SubscriptionFailed(s.clone()),
            RealtimeError::PublishFailed(s) => RealtimeError::PublishFailed(s.clone()),
            RealtimeError::ConnectionClosed => RealtimeError::ConnectionClosed,
            RealtimeError::Transport(s) => RealtimeError::Transport(s.clone()),
            RealtimeError::Protocol(s) => RealtimeError::Protocol(s.clone()),
            RealtimeError::IncompleteData => RealtimeError::IncompleteData,
            RealtimeError::Io(e) => RealtimeError::Io(Arc::clone(e)),
            RealtimeError::Config(s) => RealtimeError::Config(s.clone()),
            RealtimeError::Crypto(s) => RealtimeError::Crypto(s.clone()),
            RealtimeError::Internal(s) => RealtimeError::Internal(s.clone()),
        }
    }
}

impl PartialEq for RealtimeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RealtimeError::Io(e1), RealtimeError::Io(e2)) => e1.to_string() == e2.to_string(),
            (RealtimeError::HandshakeFailed(s1), RealtimeError::HandshakeFailed(s2)) => s1 == s2,
            (RealtimeError::SubscriptionFailed(s1), RealtimeError::SubscriptionFailed(s2)) => {
                s1 == s2
            }
            (RealtimeError::PublishFailed(s1), RealtimeError::PublishFailed(s2)) => s1 == s2,
            (RealtimeError::Transport(s1), RealtimeError::Transport(s2)) => s1 == s2,
            (RealtimeError::Protocol(s1), RealtimeError::Protocol(s2)) => s1 == s2,
            (RealtimeError::Config(s1), RealtimeError::Config(s2)) => s1 == s2,
            (RealtimeError::Crypto(s1), RealtimeError::Crypto(s2)) => s1 == s2,
            (RealtimeError::Internal(s1), RealtimeError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

impl RealtimeError {
    /// Returns true for errors that mean the underlying link is gone, as opposed
    /// to a rejected request on a healthy link.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            RealtimeError::ConnectionClosed | RealtimeError::Transport(_) | RealtimeError::Io(_)
        )
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for RealtimeError {
    fn from(e: std::io::Error) -> Self {
        RealtimeError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for RealtimeError {
    fn from(e: serde_json::Error) -> Self {
        RealtimeError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => RealtimeError::ConnectionClosed,
            WsError::Io(io) => RealtimeError::Io(Arc::new(io)),
            other => RealtimeError::Transport(other.to_string()),
        }
    }
}

impl From<std::string::FromUtf8Error> for RealtimeError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        RealtimeError::Protocol(format!("invalid UTF-8: {e}"))
    }
}

impl From<base64::DecodeError> for RealtimeError {
    fn from(e: base64::DecodeError) -> Self {
        RealtimeError::Crypto(format!("invalid base64: {e}"))
    }
}
