// src/core/connection/mod.rs

//! Owns the single realtime connection: the authenticated handshake, the
//! connection state machine and the I/O task behind an established session.

pub mod active;
pub mod manager;

pub use active::ActiveConnection;
pub use manager::{ConnectionManager, ConnectionSettings, ConnectionStatus};
