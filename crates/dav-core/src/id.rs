//! Identity types for the distributor mesh
//!
//! Distributor, user and object identifiers are 64-bit configuration object
//! ids. A data identification is the triple of object id, attribute group
//! usage and simulation variant.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Distributor identity - configuration object id of a distributor process
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DistributorId(pub u64);

impl DistributorId {
    #[inline]
    pub fn new(id: u64) -> Self {
        DistributorId(id)
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        DistributorId(u64::from_le_bytes(bytes))
    }
}

impl fmt::Debug for DistributorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dav({})", self.0)
    }
}

impl fmt::Display for DistributorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User identity - the configured user a connection authenticated as
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UserId(pub u64);

impl UserId {
    /// Pseudo user for connections authenticated with system credentials
    pub const SYSTEM: UserId = UserId(0);

    #[inline]
    pub fn new(id: u64) -> Self {
        UserId(id)
    }
}

impl fmt::Debug for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "User({})", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-local identity of one physical link.
///
/// Several links to the same distributor may exist for a short time (a
/// duplicate being rejected, a replacement link being torn down), so links
/// are told apart by this id rather than by the remote distributor id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Allocate a fresh, never reused id
    pub fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conn#{}", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Data identification a subscription refers to.
///
/// Wire format (12 bytes):
/// - Bytes 0-7: Object id (LE)
/// - Bytes 8-9: Attribute group usage id (LE)
/// - Bytes 10-11: Simulation variant (LE, signed)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BaseSubscriptionInfo {
    pub object_id: u64,
    pub usage_id: u16,
    pub simulation_variant: i16,
}

impl BaseSubscriptionInfo {
    pub const WIRE_SIZE: usize = 12;

    pub fn new(object_id: u64, usage_id: u16, simulation_variant: i16) -> Self {
        BaseSubscriptionInfo {
            object_id,
            usage_id,
            simulation_variant,
        }
    }

    pub fn to_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let mut buf = [0u8; Self::WIRE_SIZE];
        buf[0..8].copy_from_slice(&self.object_id.to_le_bytes());
        buf[8..10].copy_from_slice(&self.usage_id.to_le_bytes());
        buf[10..12].copy_from_slice(&self.simulation_variant.to_le_bytes());
        buf
    }

    pub fn from_bytes(bytes: [u8; Self::WIRE_SIZE]) -> Self {
        BaseSubscriptionInfo {
            object_id: u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
            usage_id: u16::from_le_bytes([bytes[8], bytes[9]]),
            simulation_variant: i16::from_le_bytes([bytes[10], bytes[11]]),
        }
    }
}

impl fmt::Debug for BaseSubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Data({}:{}:{})",
            self.object_id, self.usage_id, self.simulation_variant
        )
    }
}

impl fmt::Display for BaseSubscriptionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
