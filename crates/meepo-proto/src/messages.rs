//! Control message types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub const METHOD_NEW_TELEPORTATION: &str = "newTeleportation";
pub const METHOD_DO_TELEPORT: &str = "doTeleport";
pub const METHOD_CLOSE_TELEPORTATION: &str = "closeTeleportation";

/// Direction of a control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Request => write!(f, "request"),
            MessageType::Response => write!(f, "response"),
        }
    }
}

/// Envelope shared by every control message
///
/// A response carries the correlation id of the request it answers. The
/// `error` field is the only error channel of the protocol: empty means
/// success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub method: String,
    pub correlation_id: String,
    pub peer_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl Message {
    /// Create a request header with a fresh correlation id
    pub fn request(method: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Request,
            method: method.into(),
            correlation_id: Uuid::new_v4().to_string(),
            peer_id: peer_id.into(),
            error: String::new(),
        }
    }

    /// Build the response header answering this request
    pub fn invert(&self, peer_id: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::Response,
            method: self.method.clone(),
            correlation_id: self.correlation_id.clone(),
            peer_id: peer_id.into(),
            error: String::new(),
        }
    }

    /// Build a failed response header answering this request
    pub fn invert_with_error(&self, peer_id: impl Into<String>, error: impl fmt::Display) -> Self {
        let mut res = self.invert(peer_id);
        res.error = error.to_string();
        res
    }

    pub fn is_request(&self) -> bool {
        self.message_type == MessageType::Request
    }

    /// Peer-reported error, if any
    pub fn error(&self) -> Option<&str> {
        if self.error.is_empty() {
            None
        } else {
            Some(&self.error)
        }
    }
}

/// Asks the peer to create the sink half of a teleportation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTeleportationRequest {
    #[serde(flatten)]
    pub message: Message,
    pub name: String,
    pub local_network: String,
    pub local_address: String,
    pub remote_network: String,
    pub remote_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTeleportationResponse {
    #[serde(flatten)]
    pub message: Message,
}

/// Per-stream handshake, sent before any byte of the stream is relayed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoTeleportRequest {
    #[serde(flatten)]
    pub message: Message,
    pub name: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoTeleportResponse {
    #[serde(flatten)]
    pub message: Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseTeleportationRequest {
    #[serde(flatten)]
    pub message: Message,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseTeleportationResponse {
    #[serde(flatten)]
    pub message: Message,
}

impl From<Message> for NewTeleportationResponse {
    fn from(message: Message) -> Self {
        Self { message }
    }
}

impl From<Message> for DoTeleportResponse {
    fn from(message: Message) -> Self {
        Self { message }
    }
}

impl From<Message> for CloseTeleportationResponse {
    fn from(message: Message) -> Self {
        Self { message }
    }
}

/// A decoded control message of any known method
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    NewTeleportationRequest(NewTeleportationRequest),
    NewTeleportationResponse(NewTeleportationResponse),
    DoTeleportRequest(DoTeleportRequest),
    DoTeleportResponse(DoTeleportResponse),
    CloseTeleportationRequest(CloseTeleportationRequest),
    CloseTeleportationResponse(CloseTeleportationResponse),
}

impl ControlMessage {
    /// The envelope of this message
    pub fn message(&self) -> &Message {
        match self {
            ControlMessage::NewTeleportationRequest(m) => &m.message,
            ControlMessage::NewTeleportationResponse(m) => &m.message,
            ControlMessage::DoTeleportRequest(m) => &m.message,
            ControlMessage::DoTeleportResponse(m) => &m.message,
            ControlMessage::CloseTeleportationRequest(m) => &m.message,
            ControlMessage::CloseTeleportationResponse(m) => &m.message,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.message().correlation_id
    }

    pub fn method(&self) -> &str {
        &self.message().method
    }

    /// Serialize the concrete message (header flattened in) to JSON
    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            ControlMessage::NewTeleportationRequest(m) => serde_json::to_vec(m),
            ControlMessage::NewTeleportationResponse(m) => serde_json::to_vec(m),
            ControlMessage::DoTeleportRequest(m) => serde_json::to_vec(m),
            ControlMessage::DoTeleportResponse(m) => serde_json::to_vec(m),
            ControlMessage::CloseTeleportationRequest(m) => serde_json::to_vec(m),
            ControlMessage::CloseTeleportationResponse(m) => serde_json::to_vec(m),
        }
    }
}

impl From<NewTeleportationRequest> for ControlMessage {
    fn from(m: NewTeleportationRequest) -> Self {
        ControlMessage::NewTeleportationRequest(m)
    }
}

impl From<NewTeleportationResponse> for ControlMessage {
    fn from(m: NewTeleportationResponse) -> Self {
        ControlMessage::NewTeleportationResponse(m)
    }
}

impl From<DoTeleportRequest> for ControlMessage {
    fn from(m: DoTeleportRequest) -> Self {
        ControlMessage::DoTeleportRequest(m)
    }
}

impl From<DoTeleportResponse> for ControlMessage {
    fn from(m: DoTeleportResponse) -> Self {
        ControlMessage::DoTeleportResponse(m)
    }
}

impl From<CloseTeleportationRequest> for ControlMessage {
    fn from(m: CloseTeleportationRequest) -> Self {
        ControlMessage::CloseTeleportationRequest(m)
    }
}

impl From<CloseTeleportationResponse> for ControlMessage {
    fn from(m: CloseTeleportationResponse) -> Self {
        ControlMessage::CloseTeleportationResponse(m)
    }
}
