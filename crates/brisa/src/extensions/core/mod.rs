//! The vanilla peer wire protocol: handshake and core messages.

mod codec;
mod handshake_codec;

pub use codec::*;
pub use handshake_codec::*;

pub use crate::tcp_wire::{Block, BlockInfo, BLOCK_LEN};

/// Protocol String
/// String identifier of the string "BitTorrent protocol", in bytes.
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";
