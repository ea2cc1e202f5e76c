//! Protocol module - Defines the envelope protocol spoken with the cluster
//!
//! Envelopes travel over a single TCP stream, one per frame:
//! - 4 bytes magic ("SOUR")
//! - 4 bytes body length (big-endian)
//! - Variable length CBOR body (a map keyed by short text tags)

mod envelope;
mod codec;

pub use envelope::*;
pub use codec::*;

/// Default port of the cluster's bridge endpoint
pub const DEFAULT_PORT: u16 = 29999;

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 4] = [0x53, 0x4F, 0x55, 0x52]; // "SOUR"

/// Command ids are drawn from `[0, COMMAND_ID_SPACE)`
pub const COMMAND_ID_SPACE: u16 = 2048;

/// ENet event codes written at the head of every runtime frame
pub mod enet_event {
    pub const CONNECT: u16 = 1;
    pub const DISCONNECT: u16 = 2;
    pub const RECEIVE: u16 = 3;
}
