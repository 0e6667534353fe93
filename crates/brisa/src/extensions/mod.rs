//! Extensions (protocols) that act on Peers, including the core protocol.

pub mod core;
pub mod extended;
pub mod metadata;

pub use core::*;
pub use extended::*;
pub use metadata::*;
