//! Teleportation control plane
//!
//! A [`Meepo`] node keeps one transport per peer and exchanges control
//! messages over each transport's `sys` data channel. Through them it
//! negotiates teleportations: tunnels whose source half listens locally and
//! whose sink half, on the peer, dials the remote address.
//!
//! ```text
//!  alice (source)                                  bob (sink)
//!  ──────────────                                  ──────────
//!  teleport(bob, remote)
//!    └─ newTeleportation ─────────────────────────> on_new_teleportation
//!                        <──────────────── ok ─────   └─ sink registered
//!    └─ source registered, listening
//!  local conn accepted
//!    └─ doTeleport(label) ────────────────────────> sink dials remote
//!                        <──────────────── ok ─────
//!    └─ open_stream(label)  ═══ bytes ═══>  accept_stream(label)
//! ```

mod close_teleportation;
pub mod config;
pub mod error;
mod listener;
mod meepo;
mod new_teleportation;
pub mod pending_requests;
pub mod registry;
pub mod resolve;
mod rpc;
mod teleport;
pub mod transports;

pub use config::{MeepoConfig, MeepoConfigBuilder, TeleportationOptions};
pub use error::{MeepoError, MeepoResult};
pub use meepo::Meepo;
pub use pending_requests::PendingRequests;
pub use registry::{Role, SearchOrder, TeleportationInfo, TeleportationRegistry};
pub use transports::TransportManager;
