//! DAV Crypto - Authentication and link encryption
//!
//! Provides the cryptographic side of distributor links:
//! - SRP-6a mutual password authentication (RFC 5054 group, SHA-256)
//! - Fabricated verifiers for unknown users
//! - Credential lookup with single-use one-time passwords
//! - Legacy HMAC challenge/response login
//! - Login throttling
//! - AEAD encryption (ChaCha20-Poly1305) of frame bodies

pub mod aead;
pub mod credentials;
pub mod fake;
pub mod legacy;
pub mod secure_frame;
pub mod srp;
pub mod throttle;

pub use aead::*;
pub use credentials::*;
pub use fake::*;
pub use legacy::*;
pub use secure_frame::*;
pub use srp::*;
pub use throttle::*;
