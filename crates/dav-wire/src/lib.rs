//! DAV Wire Protocol - Telegram model and stream framing
//!
//! This crate implements the wire format of distributor links:
//! - Frame header (5 bytes, encryption flag + body length)
//! - Type-tagged telegram bodies
//! - Incremental frame decoding on byte streams
//! - Fragmentation of oversized data packets

pub mod codec;
pub mod flags;
pub mod fragment;
pub mod frame;
pub mod header;
pub mod telegram;

pub use flags::*;
pub use fragment::*;
pub use frame::*;
pub use header::*;
pub use telegram::*;
