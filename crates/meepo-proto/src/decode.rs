//! Method-dispatched decoding
//!
//! Control channels carry self-describing JSON payloads. The envelope is
//! decoded first, then the `(direction, method)` pair selects the constructor
//! that builds the concrete message.

use crate::codec::CodecError;
use crate::messages::*;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tracing::trace;

/// Builds a concrete control message from an already parsed payload
pub type DecodeFn = fn(serde_json::Value) -> Result<ControlMessage, CodecError>;

/// Registry of decoders keyed by message direction and method name
#[derive(Debug, Clone)]
pub struct DecoderRegistry {
    decoders: HashMap<(MessageType, String), DecodeFn>,
}

impl DecoderRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Create a registry knowing every teleportation method
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            MessageType::Request,
            METHOD_NEW_TELEPORTATION,
            decode_as::<NewTeleportationRequest>,
        );
        registry.register(
            MessageType::Response,
            METHOD_NEW_TELEPORTATION,
            decode_as::<NewTeleportationResponse>,
        );
        registry.register(
            MessageType::Request,
            METHOD_DO_TELEPORT,
            decode_as::<DoTeleportRequest>,
        );
        registry.register(
            MessageType::Response,
            METHOD_DO_TELEPORT,
            decode_as::<DoTeleportResponse>,
        );
        registry.register(
            MessageType::Request,
            METHOD_CLOSE_TELEPORTATION,
            decode_as::<CloseTeleportationRequest>,
        );
        registry.register(
            MessageType::Response,
            METHOD_CLOSE_TELEPORTATION,
            decode_as::<CloseTeleportationResponse>,
        );
        registry
    }

    /// Register (or replace) the decoder for a direction and method
    pub fn register(
        &mut self,
        message_type: MessageType,
        method: impl Into<String>,
        decoder: DecodeFn,
    ) {
        self.decoders.insert((message_type, method.into()), decoder);
    }

    pub fn contains(&self, message_type: MessageType, method: &str) -> bool {
        self.decoders
            .contains_key(&(message_type, method.to_string()))
    }

    /// Decode one JSON payload into its concrete message
    pub fn decode(&self, payload: &[u8]) -> Result<ControlMessage, CodecError> {
        let value: serde_json::Value = serde_json::from_slice(payload)?;
        let header: Message = serde_json::from_value(value.clone())?;

        let decoder = self
            .decoders
            .get(&(header.message_type, header.method.clone()))
            .ok_or_else(|| CodecError::UnknownMethod {
                message_type: header.message_type,
                method: header.method.clone(),
            })?;

        trace!(
            method = %header.method,
            message_type = %header.message_type,
            correlation_id = %header.correlation_id,
            "decoding control message"
        );

        decoder(value)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn decode_as<T>(value: serde_json::Value) -> Result<ControlMessage, CodecError>
where
    T: DeserializeOwned + Into<ControlMessage>,
{
    let message: T = serde_json::from_value(value)?;
    Ok(message.into())
}
