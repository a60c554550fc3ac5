//! Transport abstraction layer for peer connections
//!
//! This crate provides the transport-agnostic traits the teleportation
//! control plane is written against. A transport is one point-to-point
//! connection to a peer (WebRTC-like): it carries named data channels for
//! control messages, label-addressed byte streams for tunneled connections,
//! and a lifecycle state machine other components subscribe to.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 meepo-control (Meepo)                    │
//! │      RPC correlation, registry, control protocol         │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            meepo-transport (this crate)                  │
//! │  - Transport            - DataChannel                    │
//! │  - TransportConnector   - TransportListener              │
//! │  - StateBridge (lifecycle observers)                     │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────────────────┬──────────────────────────────┐
//! │ memory (in-process)      │  WebRTC and other transports  │
//! └──────────────────────────┴──────────────────────────────┘
//! ```

pub mod memory;
pub mod state;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::{self, Debug};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use memory::{Handshake, MemoryConnector, MemoryHub, MemoryListener, MemoryTransport};
pub use state::{HandleId, StateBridge, StateCallback};

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Data channel not found: {0}")]
    DataChannelNotFound(String),

    #[error("Stream already exists: {0}")]
    StreamAlreadyExists(String),

    #[error("Stream released: {0}")]
    StreamReleased(String),

    #[error("Transport not connected (state: {0})")]
    NotConnected(TransportState),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Lifecycle state of a transport
///
/// The initial state is owned by the transport implementation. `Closed` is
/// final; `Failed` may only move on to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl TransportState {
    /// Failed or closed: no more traffic will flow
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }

    pub fn can_transition_to(&self, next: TransportState) -> bool {
        match self {
            _ if *self == next => false,
            TransportState::Closed => false,
            TransportState::Failed => next == TransportState::Closed,
            _ => true,
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Byte stream carried by a transport for one tunneled connection
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// A logical message channel of a transport, used for control messages
#[async_trait]
pub trait DataChannel: Send + Sync + Debug {
    fn label(&self) -> &str;

    /// Send one message without waiting for the peer
    async fn send(&self, data: Bytes) -> TransportResult<()>;

    /// Receive the next message
    ///
    /// Returns `None` once the channel (or its transport) is closed.
    async fn recv(&self) -> TransportResult<Option<Bytes>>;
}

/// A connection to one peer
#[async_trait]
pub trait Transport: Send + Sync + Debug {
    /// Identity of the remote peer
    fn peer_id(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> TransportState;

    /// Subscribe a callback to a state transition
    ///
    /// The callback receives its own handle so it can unsubscribe itself.
    fn on_transport_state(&self, state: TransportState, callback: StateCallback) -> HandleId;

    /// Remove a callback registered with [`Transport::on_transport_state`]
    fn unset_on_transport_state(&self, state: TransportState, handle: HandleId);

    /// Look up a data channel by label
    fn data_channel(&self, label: &str) -> Option<Arc<dyn DataChannel>>;

    /// Open the byte stream for `label` towards the peer
    async fn open_stream(&self, label: &str) -> TransportResult<BoxedStream>;

    /// Wait for the peer to open the byte stream for `label`
    async fn accept_stream(&self, label: &str) -> TransportResult<BoxedStream>;

    /// Give up on `label`: a stream for it that is pending or arrives later
    /// is dropped, and the opener gets [`TransportError::StreamReleased`]
    fn release_stream(&self, label: &str);

    /// Close the transport; both sides end up `Closed`
    async fn close(&self) -> TransportResult<()>;
}

/// Establishes outgoing transports to peers
#[async_trait]
pub trait TransportConnector: Send + Sync + Debug {
    /// Start a transport to `peer_id`
    ///
    /// The returned transport may still be `Connecting`.
    async fn connect(&self, peer_id: &str) -> TransportResult<Arc<dyn Transport>>;
}

/// Accepts transports initiated by peers
#[async_trait]
pub trait TransportListener: Send + Sync + Debug {
    /// Returns `None` when no more transports will arrive
    async fn accept(&self) -> TransportResult<Option<Arc<dyn Transport>>>;
}
