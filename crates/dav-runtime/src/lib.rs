//! DAV Runtime - Distributor node
//!
//! This crate runs one distributor of the mesh:
//! - Configuration and topology (edges, replacement links, disabled neighbours)
//! - Peer connection state machine with version negotiation and mutual login
//! - Connection lifecycle (reconnects, replacement links, status reporting)
//! - Best-way routing (distance vector with path lists)
//! - Subscription propagation and central distributor election
//! - Reassembly of fragmented data telegrams
//! - Logging setup and node statistics

pub mod aggregator;
pub mod best_way;
pub mod config;
pub mod connections;
pub mod handshake;
pub mod link;
pub mod lists;
pub mod logging;
pub mod node;
pub mod peer;
pub mod stats;
pub mod subscription_info;
pub mod subscriptions;
pub mod topology;

pub use aggregator::*;
pub use best_way::*;
pub use config::*;
pub use connections::*;
pub use link::*;
pub use lists::*;
pub use logging::*;
pub use node::*;
pub use peer::*;
pub use stats::*;
pub use subscription_info::*;
pub use subscriptions::*;
pub use topology::*;
