//! Binary frame format.
//!
//! Every message travels in exactly one frame (16 byte header + payload):
//!
//! ```text
//! +--------+---------+--------+-------------+--------+
//! | magic  | version | flags  | payload_len | crc32c |
//! | 4 bytes| 2 bytes |2 bytes |   4 bytes   | 4 bytes|
//! +--------+---------+--------+-------------+--------+
//! | payload (payload_len bytes of JSON)              |
//! +--------------------------------------------------+
//! ```
//!
//! All integers are big-endian.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes opening every frame: "PBNX"
pub const MAGIC: [u8; 4] = *b"PBNX";

/// Size of the fixed frame header in bytes (4+2+2+4+4 = 16).
pub const FRAME_HEADER_SIZE: usize = 16;

/// Frame flags bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags(u16);

impl FrameFlags {
    /// The crc32c field carries a checksum of the payload.
    pub const CRC_PRESENT: u16 = 1 << 0;

    const VALID_MASK: u16 = Self::CRC_PRESENT;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_crc(mut self) -> Self {
        self.0 |= Self::CRC_PRESENT;
        self
    }

    pub fn has_crc(&self) -> bool {
        self.0 & Self::CRC_PRESENT != 0
    }

    pub fn bits(&self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Result<Self, ProtocolError> {
        if bits & !Self::VALID_MASK != 0 {
            return Err(ProtocolError::InvalidFlags(bits));
        }
        Ok(Self(bits))
    }
}

/// A single decoded frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub version: u16,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a checksummed frame around `payload`.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            version: crate::PROTOCOL_VERSION,
            flags: FrameFlags::new().with_crc(),
            payload: payload.into(),
        }
    }

    /// Creates a frame whose payload is the JSON encoding of `value`.
    pub fn from_json<T: serde::Serialize>(value: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    /// Encodes the frame, header first.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(ProtocolError::FrameTooLarge {
                size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_slice(&MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.flags.bits());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u32(if self.flags.has_crc() {
            crc32c::crc32c(&self.payload)
        } else {
            0
        });
        buf.put_slice(&self.payload);

        Ok(buf)
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched until a whole frame is
    /// buffered. The header is validated as soon as it is available, so a
    /// corrupt stream fails before its (possibly bogus) payload arrives.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != MAGIC {
            return Err(ProtocolError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes([buf[4], buf[5]]);
        if version != crate::PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }

        let flags = FrameFlags::from_bits(u16::from_be_bytes([buf[6], buf[7]]))?;

        let payload_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload_len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let crc_expected = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if buf.len() < FRAME_HEADER_SIZE + payload_len as usize {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(payload_len as usize).freeze();

        if flags.has_crc() {
            let crc_actual = crc32c::crc32c(&payload);
            if crc_actual != crc_expected {
                return Err(ProtocolError::CrcMismatch {
                    expected: crc_expected,
                    actual: crc_actual,
                });
            }
        }

        Ok(Some(Self {
            version,
            flags,
            payload,
        }))
    }
}
