//! Error types for the distributor mesh

use thiserror::Error;

use crate::DistributorId;

/// Core distributor errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DavError {
    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    #[error("Buffer too short: expected {expected}, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    #[error("Unknown telegram type: {0}")]
    UnknownTelegramType(u8),

    #[error("Frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Crypto errors
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    // Handshake errors
    #[error("Protocol negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Inconsistent login: {0}")]
    InconsistentLogin(String),

    #[error("Legacy authentication is disabled")]
    LegacyAuthenticationDisabled,

    #[error("No credentials for user {0}")]
    MissingCredentials(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection terminated: {0}")]
    ConnectionTerminated(String),

    // Protocol state errors
    #[error("Illegal state: {0}")]
    IllegalState(String),

    // Topology and configuration errors
    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown distributor {0}")]
    UnknownDistributor(DistributorId),

    // Subscription errors
    #[error("Subscription conflict: {0}")]
    SubscriptionConflict(String),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,
}

impl DavError {
    /// Whether this error ends a handshake and therefore the connection
    pub fn is_communication_error(&self) -> bool {
        matches!(
            self,
            DavError::NegotiationFailed(_)
                | DavError::Timeout(_)
                | DavError::ConnectionTerminated(_)
                | DavError::ConnectionClosed
                | DavError::TransportError(_)
        )
    }
}

/// Result type for distributor operations
pub type DavResult<T> = Result<T, DavError>;
