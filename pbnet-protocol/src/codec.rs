//! Message encoder and incremental decoder.

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::message::Message;
use bytes::BytesMut;

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a message into a single frame.
    pub fn encode_message(message: &Message) -> Result<BytesMut, ProtocolError> {
        if message.protocol.is_empty() {
            return Err(ProtocolError::MissingProtocol);
        }
        Frame::from_json(message)?.encode()
    }
}

/// Buffers stream bytes and yields whole messages.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data read from the stream.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame from the buffer.
    pub fn decode_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        Frame::decode(&mut self.buffer)
    }

    /// Attempts to decode the next message from the buffer.
    pub fn decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some(frame) = self.decode_frame()? else {
            return Ok(None);
        };
        let payload = std::str::from_utf8(&frame.payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        let message: Message = serde_json::from_str(payload)?;
        if message.protocol.is_empty() {
            return Err(ProtocolError::MissingProtocol);
        }
        Ok(Some(message))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
