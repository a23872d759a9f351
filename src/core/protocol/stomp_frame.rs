// src/core/protocol/stomp_frame.rs

//! Implements the STOMP 1.2 frame structure and the corresponding `Encoder`
//! and `Decoder` for network communication.
//!
//! A frame on the wire looks like:
//!
//! ```text
//! COMMAND\n
//! name:value\n
//! \n
//! body\0
//! ```
//!
//! A bare EOL between frames is a heart-beat.

use crate::core::RealtimeError;
use bytes::{Buf, Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

const LF: u8 = b'\n';
const CR: u8 = b'\r';
const NUL: u8 = 0;

/// Upper bound on a single frame, headers included.
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;
/// Limit on header lines per frame.
const MAX_HEADERS: usize = 1_024;

/// Every command defined by STOMP 1.2, client and server side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StompCommand {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
}

impl StompCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            StompCommand::Connect => "CONNECT",
            StompCommand::Stomp => "STOMP",
            StompCommand::Connected => "CONNECTED",
            StompCommand::Send => "SEND",
            StompCommand::Subscribe => "SUBSCRIBE",
            StompCommand::Unsubscribe => "UNSUBSCRIBE",
            StompCommand::Disconnect => "DISCONNECT",
            StompCommand::Message => "MESSAGE",
            StompCommand::Receipt => "RECEIPT",
            StompCommand::Error => "ERROR",
            StompCommand::Ack => "ACK",
            StompCommand::Nack => "NACK",
            StompCommand::Begin => "BEGIN",
            StompCommand::Commit => "COMMIT",
            StompCommand::Abort => "ABORT",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let command = match bytes {
            b"CONNECT" => StompCommand::Connect,
            b"STOMP" => StompCommand::Stomp,
            b"CONNECTED" => StompCommand::Connected,
            b"SEND" => StompCommand::Send,
            b"SUBSCRIBE" => StompCommand::Subscribe,
            b"UNSUBSCRIBE" => StompCommand::Unsubscribe,
            b"DISCONNECT" => StompCommand::Disconnect,
            b"MESSAGE" => StompCommand::Message,
            b"RECEIPT" => StompCommand::Receipt,
            b"ERROR" => StompCommand::Error,
            b"ACK" => StompCommand::Ack,
            b"NACK" => StompCommand::Nack,
            b"BEGIN" => StompCommand::Begin,
            b"COMMIT" => StompCommand::Commit,
            b"ABORT" => StompCommand::Abort,
            _ => return None,
        };
        Some(command)
    }

    /// CONNECT and CONNECTED frames carry raw header values (1.0 compatibility).
    fn escapes_headers(&self) -> bool {
        !matches!(self, StompCommand::Connect | StompCommand::Connected)
    }
}

impl fmt::Display for StompCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single STOMP frame. Headers keep their wire order; repeated names are
/// allowed and the first occurrence wins on lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct StompFrame {
    pub command: StompCommand,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl StompFrame {
    pub fn new(command: StompCommand) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Appends a header, builder style.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// A convenience method to encode a frame into a `Vec<u8>`.
    /// The WebSocket transport sends exactly one frame per message.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, RealtimeError> {
        let mut buf = BytesMut::new();
        StompFrameCodec.encode(StompItem::Frame(self.clone()), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// What the decoder yields: either a complete frame or a heart-beat EOL.
#[derive(Debug, Clone, PartialEq)]
pub enum StompItem {
    Frame(StompFrame),
    Heartbeat,
}

impl From<StompFrame> for StompItem {
    fn from(frame: StompFrame) -> Self {
        StompItem::Frame(frame)
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding STOMP frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct StompFrameCodec;

impl Encoder<StompItem> for StompFrameCodec {
    type Error = RealtimeError;

    fn encode(&mut self, item: StompItem, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = match item {
            StompItem::Heartbeat => {
                dst.extend_from_slice(b"\n");
                return Ok(());
            }
            StompItem::Frame(frame) => frame,
        };

        let escape = frame.command.escapes_headers();
        dst.extend_from_slice(frame.command.as_str().as_bytes());
        dst.extend_from_slice(b"\n");

        let mut has_content_length = false;
        for (name, value) in &frame.headers {
            if name == "content-length" {
                has_content_length = true;
            }
            if escape {
                dst.extend_from_slice(escape_header(name).as_bytes());
                dst.extend_from_slice(b":");
                dst.extend_from_slice(escape_header(value).as_bytes());
            } else {
                if name.contains([':', '\n']) || value.contains('\n') {
                    return Err(RealtimeError::Protocol(format!(
                        "header '{name}' cannot be represented in a {} frame",
                        frame.command
                    )));
                }
                dst.extend_from_slice(name.as_bytes());
                dst.extend_from_slice(b":");
                dst.extend_from_slice(value.as_bytes());
            }
            dst.extend_from_slice(b"\n");
        }
        if !frame.body.is_empty() && !has_content_length {
            dst.extend_from_slice(b"content-length:");
            dst.extend_from_slice(frame.body.len().to_string().as_bytes());
            dst.extend_from_slice(b"\n");
        }

        dst.extend_from_slice(b"\n");
        dst.extend_from_slice(&frame.body);
        dst.extend_from_slice(&[NUL]);
        Ok(())
    }
}

impl Decoder for StompFrameCodec {
    type Item = StompItem;
    type Error = RealtimeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        // Heart-beats are bare EOLs between frames.
        match src[0] {
            LF => {
                src.advance(1);
                return Ok(Some(StompItem::Heartbeat));
            }
            CR => {
                if src.len() < 2 {
                    return Ok(None);
                }
                if src[1] != LF {
                    return Err(RealtimeError::Protocol("stray CR between frames".into()));
                }
                src.advance(2);
                return Ok(Some(StompItem::Heartbeat));
            }
            _ => {}
        }

        let mut bytes = &src[..];
        match self.parse_frame(&mut bytes) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(StompItem::Frame(frame)))
            }
            // Need more data, unless the buffer has already outgrown any legal frame.
            Err(RealtimeError::IncompleteData) => {
                if src.len() > MAX_FRAME_SIZE {
                    Err(RealtimeError::Protocol(format!(
                        "frame exceeds {MAX_FRAME_SIZE} bytes"
                    )))
                } else {
                    Ok(None)
                }
            }
            Err(e) => Err(e),
        }
    }
}

impl StompFrameCodec {
    /// Parses one frame from the front of `bytes`, advancing the slice past it.
    fn parse_frame(&self, bytes: &mut &[u8]) -> Result<StompFrame, RealtimeError> {
        let command_line = parse_line(bytes)?;
        let command = StompCommand::from_bytes(command_line).ok_or_else(|| {
            RealtimeError::Protocol(format!(
                "unknown command '{}'",
                String::from_utf8_lossy(command_line)
            ))
        })?;
        let escape = command.escapes_headers();

        let mut headers = Vec::new();
        loop {
            let line = parse_line(bytes)?;
            if line.is_empty() {
                break;
            }
            if headers.len() >= MAX_HEADERS {
                return Err(RealtimeError::Protocol("too many headers".into()));
            }
            let colon = line.iter().position(|&b| b == b':').ok_or_else(|| {
                RealtimeError::Protocol(format!(
                    "malformed header line '{}'",
                    String::from_utf8_lossy(line)
                ))
            })?;
            let name = String::from_utf8(line[..colon].to_vec())?;
            let value = String::from_utf8(line[colon + 1..].to_vec())?;
            if escape {
                headers.push((unescape_header(&name)?, unescape_header(&value)?));
            } else {
                headers.push((name, value));
            }
        }

        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .map(|(_, v)| {
                v.trim().parse::<usize>().map_err(|_| {
                    RealtimeError::Protocol(format!("invalid content-length '{v}'"))
                })
            })
            .transpose()?;

        let body = match content_length {
            Some(len) => {
                if len > MAX_FRAME_SIZE {
                    return Err(RealtimeError::Protocol(format!(
                        "content-length {len} exceeds {MAX_FRAME_SIZE} bytes"
                    )));
                }
                if bytes.len() < len + 1 {
                    return Err(RealtimeError::IncompleteData);
                }
                if bytes[len] != NUL {
                    return Err(RealtimeError::Protocol(
                        "frame body not terminated by NUL".into(),
                    ));
                }
                let body = Bytes::copy_from_slice(&bytes[..len]);
                *bytes = &bytes[len + 1..];
                body
            }
            None => {
                let end = bytes
                    .iter()
                    .position(|&b| b == NUL)
                    .ok_or(RealtimeError::IncompleteData)?;
                let body = Bytes::copy_from_slice(&bytes[..end]);
                *bytes = &bytes[end + 1..];
                body
            }
        };

        Ok(StompFrame {
            command,
            headers,
            body,
        })
    }
}

/// Returns the next line without its EOL (`\n` or `\r\n`) and advances past it.
fn parse_line<'a>(bytes: &mut &'a [u8]) -> Result<&'a [u8], RealtimeError> {
    let pos = bytes
        .iter()
        .position(|&b| b == LF)
        .ok_or(RealtimeError::IncompleteData)?;
    let mut line = &bytes[..pos];
    if line.last() == Some(&CR) {
        line = &line[..line.len() - 1];
    }
    *bytes = &bytes[pos + 1..];
    Ok(line)
}

fn escape_header(raw: &str) -> Cow<'_, str> {
    if !raw.contains(['\\', '\r', '\n', ':']) {
        return Cow::Borrowed(raw);
    }
    let mut out = String::with_capacity(raw.len() + 4);
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

fn unescape_header(raw: &str) -> Result<String, RealtimeError> {
    if !raw.contains('\\') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            other => {
                return Err(RealtimeError::Protocol(format!(
                    "undefined header escape '\\{}'",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}
