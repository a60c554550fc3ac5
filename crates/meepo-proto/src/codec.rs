//! Codec for encoding/decoding control messages

use crate::decode::DecoderRegistry;
use crate::messages::{ControlMessage, MessageType};
use crate::MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("Unknown {message_type} method: {method}")]
    UnknownMethod {
        message_type: MessageType,
        method: String,
    },
}

/// Control message codec
///
/// Format: [length: u32][payload: JSON serialized message]
#[derive(Debug, Clone)]
pub struct MessageCodec {
    registry: Arc<DecoderRegistry>,
}

impl MessageCodec {
    pub fn new(registry: Arc<DecoderRegistry>) -> Self {
        Self { registry }
    }

    /// Encode a control message to a length-prefixed frame
    pub fn encode(msg: &ControlMessage) -> Result<Bytes, CodecError> {
        let payload = msg.to_json()?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a control message from bytes
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error. A frame that fails to decode is still consumed, so the
    /// caller may log the error and keep reading.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<ControlMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let payload = buf.split_to(length);

        self.registry.decode(&payload).map(Some)
    }

    /// Try to decode multiple messages from buffer
    pub fn decode_all(&self, buf: &mut BytesMut) -> Result<Vec<ControlMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = self.decode(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new(Arc::new(DecoderRegistry::with_defaults()))
    }
}
