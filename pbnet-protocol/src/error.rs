//! Framing and message decoding errors.

use thiserror::Error;

/// Errors raised while framing or decoding messages.
///
/// Any of these on an inbound stream means the peer sent an invalid message;
/// the endpoint that sees one closes without attempting to resynchronize.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'PBNX', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported wire version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("message names no protocol")]
    MissingProtocol,
}
