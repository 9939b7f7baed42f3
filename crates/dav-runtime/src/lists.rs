//! Lists telegrams
//!
//! Distributors exchange lists of the objects they serve so that potential
//! central distributors can be narrowed down. The lists themselves belong to
//! the configuration layer; the mesh only delivers them.

use dav_core::DistributorId;
use dav_wire::ListsTelegram;

/// Receives lists telegrams from neighbours
pub trait ListsHandler: Send + Sync {
    fn lists_subscription(&self, from: DistributorId, telegram: &ListsTelegram);

    fn lists_unsubscription(&self, from: DistributorId, telegram: &ListsTelegram);

    fn lists_update(&self, from: DistributorId, telegram: &ListsTelegram);
}

/// Logs and drops lists telegrams
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreLists;

impl ListsHandler for IgnoreLists {
    fn lists_subscription(&self, from: DistributorId, telegram: &ListsTelegram) {
        tracing::debug!(remote = %from, "lists subscription for {} ignored", telegram.distributor);
    }

    fn lists_unsubscription(&self, from: DistributorId, telegram: &ListsTelegram) {
        tracing::debug!(remote = %from, "lists unsubscription for {} ignored", telegram.distributor);
    }

    fn lists_update(&self, from: DistributorId, telegram: &ListsTelegram) {
        tracing::debug!(
            remote = %from,
            "lists update of {} ({} bytes) ignored",
            telegram.distributor,
            telegram.payload.len()
        );
    }
}
