//! DAV Transport Layer - Telegram channels between distributors
//!
//! This crate provides:
//! - The `TelegramChannel` abstraction used by peer connections
//! - A stream channel over TCP (or any async byte stream)
//! - Keep-alive in both directions
//! - Switching frame encryption on and off during a session

pub mod channel;
pub mod stream;

pub use channel::*;
pub use stream::*;
