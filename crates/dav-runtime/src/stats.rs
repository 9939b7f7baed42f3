//! Node statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the node counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeStats {
    pub connections_established: u64,
    pub connections_terminated: u64,
    pub authentication_failures: u64,
    pub duplicates_rejected: u64,
    pub telegrams_routed: u64,
    pub telegrams_dropped: u64,
    pub fragment_errors: u64,
    pub reconnect_attempts: u64,
}

/// Live counters, shared by all parts of a node
#[derive(Debug, Default)]
pub struct NodeCounters {
    connections_established: AtomicU64,
    connections_terminated: AtomicU64,
    authentication_failures: AtomicU64,
    duplicates_rejected: AtomicU64,
    telegrams_routed: AtomicU64,
    telegrams_dropped: AtomicU64,
    fragment_errors: AtomicU64,
    reconnect_attempts: AtomicU64,
}

impl NodeCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_terminated(&self) {
        self.connections_terminated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn authentication_failed(&self) {
        self.authentication_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_rejected(&self) {
        self.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telegram_routed(&self) {
        self.telegrams_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telegram_dropped(&self) {
        self.telegrams_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fragment_error(&self) {
        self.fragment_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reconnect_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> NodeStats {
        NodeStats {
            connections_established: self.connections_established.load(Ordering::Relaxed),
            connections_terminated: self.connections_terminated.load(Ordering::Relaxed),
            authentication_failures: self.authentication_failures.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            telegrams_routed: self.telegrams_routed.load(Ordering::Relaxed),
            telegrams_dropped: self.telegrams_dropped.load(Ordering::Relaxed),
            fragment_errors: self.fragment_errors.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let counters = NodeCounters::new();
        counters.connection_established();
        counters.connection_established();
        counters.fragment_error();
        let stats = counters.snapshot();
        assert_eq!(stats.connections_established, 2);
        assert_eq!(stats.fragment_errors, 1);
        assert_eq!(stats.telegrams_dropped, 0);
    }
}
