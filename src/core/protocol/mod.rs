// src/core/protocol/mod.rs

pub mod heartbeat;
pub mod stomp_frame;
pub use heartbeat::{HeartBeat, NegotiatedHeartBeat};
pub use stomp_frame::{MAX_FRAME_SIZE, StompCommand, StompFrame, StompFrameCodec, StompItem};
