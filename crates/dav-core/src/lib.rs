//! DAV Core - Fundamental types of the distributor mesh
//!
//! This crate defines the types shared by every layer:
//! - Identifiers (DistributorId, UserId, ConnectionId, BaseSubscriptionInfo)
//! - Link and subscription state values
//! - Error type

pub mod error;
pub mod id;
pub mod state;

pub use error::*;
pub use id::*;
pub use state::*;
