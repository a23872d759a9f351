// src/core/protocol/heartbeat.rs

//! Parsing and negotiation of the STOMP `heart-beat` header.

use crate::core::RealtimeError;
use std::time::Duration;

/// One side's heart-beat declaration: how often it can send (`outgoing`) and
/// how often it wants to receive (`incoming`). A zero duration means "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeartBeat {
    pub outgoing: Duration,
    pub incoming: Duration,
}

/// The result of combining the client's and the server's declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NegotiatedHeartBeat {
    /// How often the client must emit a beat when otherwise idle.
    pub send_every: Option<Duration>,
    /// How often the client should hear from the server.
    pub expect_every: Option<Duration>,
}

impl HeartBeat {
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    /// Renders the `cx,cy` header value in milliseconds.
    pub fn header_value(&self) -> String {
        format!(
            "{},{}",
            self.outgoing.as_millis(),
            self.incoming.as_millis()
        )
    }

    /// Parses an `sx,sy` header value.
    pub fn parse(value: &str) -> Result<Self, RealtimeError> {
        let (out, inc) = value
            .split_once(',')
            .ok_or_else(|| RealtimeError::Protocol(format!("invalid heart-beat '{value}'")))?;
        let parse_ms = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| RealtimeError::Protocol(format!("invalid heart-beat '{value}'")))
        };
        Ok(Self {
            outgoing: parse_ms(out)?,
            incoming: parse_ms(inc)?,
        })
    }

    /// Combines this (client) declaration with the server's.
    pub fn negotiate(&self, server: &HeartBeat) -> NegotiatedHeartBeat {
        let pick = |mine: Duration, theirs: Duration| {
            if mine.is_zero() || theirs.is_zero() {
                None
            } else {
                Some(mine.max(theirs))
            }
        };
        NegotiatedHeartBeat {
            send_every: pick(self.outgoing, server.incoming),
            expect_every: pick(self.incoming, server.outgoing),
        }
    }
}

impl NegotiatedHeartBeat {
    /// How long the link may stay silent before the peer is considered gone.
    pub fn silence_limit(&self) -> Option<Duration> {
        self.expect_every.map(|d| d * 2)
    }
}
