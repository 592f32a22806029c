//! # pbnet-protocol
//!
//! Wire format shared by every pbnet endpoint.
//!
//! This crate provides:
//! - Binary framing with length prefix and CRC32C validation
//! - Protocol-addressed messages (`REQUEST` / `REPLY`) with JSON bodies
//! - Bodies for the built-in session, keepalive and event protocols
//! - Admin shutdown event names

pub mod codec;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use error::ProtocolError;
pub use frame::{Frame, FrameFlags, FRAME_HEADER_SIZE, MAGIC};
pub use message::{
    EventBody, KeepAliveBody, Message, MessageKind, SessionBody, ShutdownMode, ERROR_EVENT,
    EVENT_PROTOCOL, KEEPALIVE_PROTOCOL, SESSION_PROTOCOL,
};

/// Wire version spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Default port for a pbnet server.
pub const DEFAULT_PORT: u16 = 3100;

/// Default host for a pbnet server.
pub const DEFAULT_HOST: &str = "localhost";

/// Maximum frame payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;
