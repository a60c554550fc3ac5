//! Errors surfaced by the control plane

use meepo_proto::{AddrError, CodecError};
use meepo_teleportation::TeleportationError;
use meepo_transport::TransportError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeepoError {
    #[error("transport not exist: {0}")]
    TransportNotExist(String),

    #[error("transport not connected: {0}")]
    TransportNotConnected(String),

    #[error("teleportation not exist")]
    TeleportationNotExist,

    #[error("teleportation already exist: {0}")]
    TeleportationAlreadyExist(String),

    #[error("request timed out")]
    Timeout,

    #[error("transport disconnected before response")]
    Disconnected,

    /// Error text reported by the remote peer
    #[error("{0}")]
    Peer(String),

    #[error("unexpected response to {0}")]
    UnexpectedResponse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Addr(#[from] AddrError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Teleportation(#[from] TeleportationError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type MeepoResult<T> = Result<T, MeepoError>;
