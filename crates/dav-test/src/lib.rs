//! DAV Test Harness - Routing simulation and multi-node testing
//!
//! This crate provides:
//! - Shortest path oracle for routing checks
//! - In-memory best-way routing simulator with seeded delivery order
//! - Local mesh of real distributors on loopback listeners

pub mod mesh;
pub mod oracle;
pub mod simulator;

pub use mesh::*;
pub use oracle::*;
pub use simulator::*;
