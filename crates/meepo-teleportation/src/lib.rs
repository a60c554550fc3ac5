//! Teleportation data path
//!
//! A teleportation is a tunnel between a local listen address and a remote
//! address, realized as two cooperating halves:
//!
//! - [`TeleportationSource`] lives on the initiating peer. It consumes
//!   [`DialRequest`]s (accepted local connections), performs the per-stream
//!   handshake through its do-teleport callback and then relays bytes over a
//!   transport stream named by the stream's label.
//! - [`TeleportationSink`] lives on the receiving peer. For each label it
//!   dials the sink address and relays the transport stream into it.
//!
//! Halves never touch the control plane directly: they report teardown
//! through the `on_close` / `on_error` handlers exactly once.

pub mod config;
pub mod lifecycle;
pub mod sink;
pub mod source;
pub mod task_tracker;

use async_trait::async_trait;
use futures::future::BoxFuture;
use meepo_proto::Addr;
use meepo_transport::{Transport, TransportError};
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;

pub use config::{SinkConfig, SinkConfigBuilder, SourceConfig, SourceConfigBuilder};
pub use lifecycle::{CloseGate, Phase};
pub use sink::TeleportationSink;
pub use source::TeleportationSource;
pub use task_tracker::StreamTracker;

/// Default time allowed for the sink to dial its target
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default time the sink waits for the source to open a stream
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TeleportationError {
    #[error("Missing required option: {0}")]
    MissingOption(&'static str),

    #[error("Do teleport failed: {0}")]
    DoTeleport(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Dial {0} timed out")]
    DialTimeout(Addr),

    #[error("Timed out waiting for stream {0}")]
    StreamTimeout(String),

    #[error("Teleportation closed")]
    Closed,
}

impl TeleportationError {
    /// Whether the error means the transport can no longer carry streams
    pub fn is_transport_lost(&self) -> bool {
        matches!(
            self,
            TeleportationError::Transport(TransportError::NotConnected(_))
                | TeleportationError::Transport(TransportError::ChannelClosed)
        )
    }
}

/// Invoked once when a half closes normally
pub type OnCloseHandler = Arc<dyn Fn() + Send + Sync>;

/// Invoked once when a half is torn down by an error
pub type OnErrorHandler = Arc<dyn Fn(TeleportationError) + Send + Sync>;

/// Performs the per-stream handshake for a label; the source waits on it
/// before relaying any byte of the stream
pub type DoTeleportFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<(), TeleportationError>> + Send + Sync>;

/// An accepted local connection waiting to be teleported
#[derive(Debug)]
pub struct DialRequest {
    conn: TcpStream,
    peer_addr: SocketAddr,
}

impl DialRequest {
    pub fn new(conn: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { conn, peer_addr }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn into_parts(self) -> (TcpStream, SocketAddr) {
        (self.conn, self.peer_addr)
    }
}

/// Accessors shared by both halves
#[async_trait]
pub trait Teleportation: Send + Sync + Debug {
    fn name(&self) -> &str;

    /// Local listen address of the initiator
    fn source(&self) -> Addr;

    /// Address the sink side dials
    fn sink(&self) -> Addr;

    fn transport(&self) -> Arc<dyn Transport>;

    fn phase(&self) -> Phase;

    /// Number of streams currently relaying
    fn active_streams(&self) -> usize;

    /// Tear the half down; a second call is a no-op
    async fn close(&self) -> Result<(), TeleportationError>;
}
