// src/core/mod.rs

//! The realtime notification core: credentials, the STOMP connection, topic
//! subscriptions and the send path.

pub mod client;
pub mod connection;
pub mod credentials;
pub mod dispatch;
pub mod errors;
pub mod protocol;
pub mod pubsub;
pub mod transport;

pub use client::RealtimeClient;
pub use connection::{ConnectionManager, ConnectionSettings, ConnectionStatus};
pub use dispatch::OutboundBody;
pub use errors::RealtimeError;
pub use pubsub::{InboundMessage, Payload, SubscriptionHandle};
