//! Meepo Protocol Definitions
//!
//! This crate defines the control message envelope, the concrete
//! request/response shapes of the teleportation protocol, the
//! method-dispatched decoder and the frame codec used on control channels.

pub mod addr;
pub mod codec;
pub mod decode;
pub mod messages;

pub use addr::{Addr, AddrError, Network};
pub use codec::{CodecError, MessageCodec};
pub use decode::{DecodeFn, DecoderRegistry};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Label of the data channel that carries control messages
pub const CONTROL_CHANNEL_LABEL: &str = "sys";
