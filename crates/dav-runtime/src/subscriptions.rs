//! Subscription manager
//!
//! Owns the [`SubscriptionInfo`] of every data identification this
//! distributor knows about. Callers open an info, change it and close it
//! again; closing re-runs the central distributor election of that info,
//! sends the resulting telegrams and drops the info once it is empty.
//! Route and connection changes re-evaluate every info.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard};

use dav_core::{
    BaseSubscriptionInfo, ConnectionId, DavResult, DistributorId, ReceiptCode, TransmitterSubscriptionType, UserId,
};
use dav_wire::{DataTelegram, ReceiptTelegram, SubscriptionTelegram, Telegram, UnsubscriptionTelegram};

use crate::subscription_info::{Action, Evaluation};
use crate::{
    CentralState, LocalRole, LocalSubscriber, LocalSubscriptionId, RouteChangeListener, RouteLookup,
    SubscriptionInfo, TransmitterLink,
};

/// Decides whether a user may subscribe (external role engine)
pub trait AccessControl: Send + Sync {
    fn is_allowed(&self, user: UserId, info: &BaseSubscriptionInfo, role: LocalRole) -> bool;
}

/// Grants everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessControl for AllowAll {
    fn is_allowed(&self, _user: UserId, _info: &BaseSubscriptionInfo, _role: LocalRole) -> bool {
        true
    }
}

/// Distributors that may be central for a data identification
pub trait PotentialCentralDistributors: Send + Sync {
    fn potential_centrals(&self, info: &BaseSubscriptionInfo) -> Vec<DistributorId>;
}

/// Every distributor with a route is a candidate
pub struct ReachableDistributors {
    routes: Arc<dyn RouteLookup>,
}

impl ReachableDistributors {
    pub fn new(routes: Arc<dyn RouteLookup>) -> Self {
        ReachableDistributors { routes }
    }
}

impl PotentialCentralDistributors for ReachableDistributors {
    fn potential_centrals(&self, _info: &BaseSubscriptionInfo) -> Vec<DistributorId> {
        self.routes.reachable()
    }
}

/// Read-only view of one info
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub info: BaseSubscriptionInfo,
    pub source_central: CentralState,
    pub drain_central: CentralState,
    pub local_subscriptions: usize,
    pub remote_subscriptions: usize,
    pub outgoing_subscriptions: usize,
    pub data_index: u64,
}

#[derive(Default)]
struct SubscriptionTable {
    infos: HashMap<BaseSubscriptionInfo, SubscriptionInfo>,
}

/// Per-distributor subscription state
pub struct SubscriptionManager {
    local: DistributorId,
    routes: Arc<dyn RouteLookup>,
    potential: Arc<dyn PotentialCentralDistributors>,
    access: Arc<dyn AccessControl>,
    table: Mutex<SubscriptionTable>,
    index_base: u64,
    dropped: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(
        local: DistributorId,
        routes: Arc<dyn RouteLookup>,
        potential: Arc<dyn PotentialCentralDistributors>,
        access: Arc<dyn AccessControl>,
    ) -> Self {
        // Indexes of a restarted central distributor keep growing
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        SubscriptionManager {
            local,
            routes,
            potential,
            access,
            table: Mutex::new(SubscriptionTable::default()),
            index_base: started << 32,
            dropped: AtomicU64::new(0),
        }
    }

    /// Every reachable distributor is a potential central, everyone is allowed
    pub fn with_defaults(local: DistributorId, routes: Arc<dyn RouteLookup>) -> Self {
        let potential = Arc::new(ReachableDistributors::new(routes.clone()));
        Self::new(local, routes, potential, Arc::new(AllowAll))
    }

    pub fn local_id(&self) -> DistributorId {
        self.local
    }

    /// Open the info for `info`, creating it if needed
    pub fn open_subscription_info(&self, info: BaseSubscriptionInfo) -> OpenSubscriptionInfo<'_> {
        let mut table = self.table.lock();
        let entry = table
            .infos
            .remove(&info)
            .unwrap_or_else(|| SubscriptionInfo::new(info, self.index_base));
        OpenSubscriptionInfo {
            manager: self,
            table,
            info: entry,
        }
    }

    /// Open the info for `info` if it exists
    pub fn open_existing_subscription_info(&self, info: BaseSubscriptionInfo) -> Option<OpenSubscriptionInfo<'_>> {
        let mut table = self.table.lock();
        let entry = table.infos.remove(&info)?;
        Some(OpenSubscriptionInfo {
            manager: self,
            table,
            info: entry,
        })
    }

    pub fn subscription_info(&self, info: BaseSubscriptionInfo) -> Option<SubscriptionSnapshot> {
        let table = self.table.lock();
        table.infos.get(&info).map(snapshot)
    }

    pub fn subscription_infos(&self) -> Vec<SubscriptionSnapshot> {
        let table = self.table.lock();
        let mut all: Vec<_> = table.infos.values().map(snapshot).collect();
        all.sort_by_key(|s| s.info);
        all
    }

    /// Packets dropped by the data path
    pub fn dropped_data(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Local application subscription
    pub fn subscribe_local(
        &self,
        info: BaseSubscriptionInfo,
        role: LocalRole,
        user: UserId,
        subscriber: Arc<dyn LocalSubscriber>,
    ) -> DavResult<LocalSubscriptionId> {
        let mut open = self.open_subscription_info(info);
        open.add_local(role, user, subscriber)
    }

    pub fn unsubscribe_local(&self, info: BaseSubscriptionInfo, id: LocalSubscriptionId) -> bool {
        match self.open_existing_subscription_info(info) {
            Some(mut open) => open.remove_local(id),
            None => false,
        }
    }

    /// Data from a local source or sender. Returns the data index, `0` for
    /// data on its way to a remote drain.
    pub fn publish(&self, info: BaseSubscriptionInfo, id: LocalSubscriptionId, payload: Bytes) -> DavResult<u64> {
        let mut actions = Vec::new();
        let result = {
            let mut table = self.table.lock();
            match table.infos.get_mut(&info) {
                Some(entry) => entry.publish_local(self.local, id, payload, &mut actions),
                None => Err(dav_core::DavError::SubscriptionConflict(format!("{} is not subscribed", info))),
            }
        };
        self.execute(actions);
        result
    }

    pub fn next_data_index(&self, info: BaseSubscriptionInfo) -> Option<u64> {
        let mut table = self.table.lock();
        table.infos.get_mut(&info).map(|i| i.next_data_index())
    }

    pub fn current_data_index(&self, info: BaseSubscriptionInfo) -> Option<u64> {
        let table = self.table.lock();
        table.infos.get(&info).map(|i| i.current_data_index())
    }

    pub fn central_state(&self, info: BaseSubscriptionInfo, kind: TransmitterSubscriptionType) -> Option<CentralState> {
        let table = self.table.lock();
        table.infos.get(&info).map(|i| i.central(kind))
    }

    pub fn handle_subscription(&self, link: Arc<dyn TransmitterLink>, telegram: SubscriptionTelegram) {
        if telegram.distributors.is_empty() {
            let receipt = Telegram::SubscriptionReceipt(ReceiptTelegram {
                info: telegram.info,
                kind: telegram.kind,
                code: ReceiptCode::Negative,
                central: None,
            });
            if let Err(e) = link.send_telegram(receipt) {
                tracing::debug!(remote = %link.remote_id(), "receipt not sent: {}", e);
            }
            return;
        }
        let mut open = self.open_subscription_info(telegram.info);
        open.update_remote(link, telegram.kind, telegram.distributors);
    }

    pub fn handle_unsubscription(&self, link: &Arc<dyn TransmitterLink>, telegram: UnsubscriptionTelegram) {
        if let Some(mut open) = self.open_existing_subscription_info(telegram.info) {
            if !open.remove_remote(link.connection_id(), telegram.kind) {
                tracing::debug!(remote = %link.remote_id(), "unsubscription of unknown {} ignored", telegram.info);
            }
        }
    }

    pub fn handle_receipt(&self, link: &Arc<dyn TransmitterLink>, telegram: ReceiptTelegram) {
        match self.open_existing_subscription_info(telegram.info) {
            Some(mut open) => {
                if !open.handle_receipt(link.connection_id(), telegram.kind, telegram.code, telegram.central) {
                    tracing::debug!(remote = %link.remote_id(), "receipt for {} without subscription", telegram.info);
                }
            }
            None => tracing::debug!(remote = %link.remote_id(), "receipt for unknown {}", telegram.info),
        }
    }

    /// Complete (reassembled) data packet from a neighbour
    pub fn handle_data(&self, link: &Arc<dyn TransmitterLink>, fragments: Vec<DataTelegram>) -> bool {
        let Some(info) = fragments.first().map(|f| f.info) else {
            return false;
        };
        let mut actions = Vec::new();
        let result = {
            let mut table = self.table.lock();
            match table.infos.get_mut(&info) {
                Some(entry) => entry.handle_data(self.local, link.connection_id(), fragments, &mut actions),
                None => Err(dav_core::DavError::IllegalState(format!("{} is not subscribed", info))),
            }
        };
        self.execute(actions);
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(remote = %link.remote_id(), "data dropped: {}", e);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// A link finished initialisation
    pub fn connection_added(&self, _link: &Arc<dyn TransmitterLink>) {
        self.reevaluate_all();
    }

    /// A link is gone; drop everything that went over it
    pub fn connection_removed(&self, connection: ConnectionId) {
        let actions = {
            let mut table = self.table.lock();
            for info in table.infos.values_mut() {
                info.remove_connection(connection);
            }
            self.evaluate_table(&mut table)
        };
        self.execute(actions);
    }

    /// Access rights of `user` changed
    pub fn handle_user_rights_changed(&self, user: UserId) {
        tracing::debug!("rights of user {} changed", user);
        self.reevaluate_all();
    }

    pub fn reevaluate_all(&self) {
        let actions = {
            let mut table = self.table.lock();
            self.evaluate_table(&mut table)
        };
        self.execute(actions);
    }

    fn evaluation(&self) -> Evaluation<'_> {
        Evaluation {
            local: self.local,
            routes: self.routes.as_ref(),
            potential: self.potential.as_ref(),
            access: self.access.as_ref(),
        }
    }

    fn evaluate_table(&self, table: &mut SubscriptionTable) -> Vec<Action> {
        let ctx = self.evaluation();
        let mut actions = Vec::new();
        for info in table.infos.values_mut() {
            info.evaluate(&ctx, &mut actions);
        }
        table.infos.retain(|_, info| !info.is_empty());
        actions
    }

    fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send(link, telegram) => {
                    if let Err(e) = link.send_telegram(telegram) {
                        tracing::debug!(remote = %link.remote_id(), "subscription telegram not sent: {}", e);
                    }
                }
                Action::SenderState(subscriber, info, state) => subscriber.sender_state(info, state),
                Action::ReceiverState(subscriber, info, state) => subscriber.receiver_state(info, state),
                Action::Deliver(subscriber, info, index, payload) => subscriber.data(info, index, payload),
            }
        }
    }
}

impl RouteChangeListener for SubscriptionManager {
    fn route_changed(
        &self,
        destination: DistributorId,
        _old: Option<&Arc<dyn TransmitterLink>>,
        _new: Option<&Arc<dyn TransmitterLink>>,
    ) {
        tracing::trace!(destination = %destination, "re-evaluating subscriptions after route change");
        self.reevaluate_all();
    }
}

fn snapshot(info: &SubscriptionInfo) -> SubscriptionSnapshot {
    let streams = [
        info.stream(TransmitterSubscriptionType::Receiver),
        info.stream(TransmitterSubscriptionType::Sender),
    ];
    SubscriptionSnapshot {
        info: info.base(),
        source_central: streams[0].central,
        drain_central: streams[1].central,
        local_subscriptions: streams.iter().map(|s| s.locals.len()).sum(),
        remote_subscriptions: streams.iter().map(|s| s.remotes.len()).sum(),
        outgoing_subscriptions: streams.iter().map(|s| s.outgoing.len()).sum(),
        data_index: info.current_data_index(),
    }
}

/// Checked-out info. Dropping it closes the info: the election is re-run,
/// resulting telegrams are sent and an empty info is removed.
///
/// Holds the manager lock; do not open a second info while one is open.
pub struct OpenSubscriptionInfo<'a> {
    manager: &'a SubscriptionManager,
    table: MutexGuard<'a, SubscriptionTable>,
    info: SubscriptionInfo,
}

impl OpenSubscriptionInfo<'_> {
    /// Close explicitly
    pub fn close(self) {}
}

impl Deref for OpenSubscriptionInfo<'_> {
    type Target = SubscriptionInfo;

    fn deref(&self) -> &SubscriptionInfo {
        &self.info
    }
}

impl DerefMut for OpenSubscriptionInfo<'_> {
    fn deref_mut(&mut self) -> &mut SubscriptionInfo {
        &mut self.info
    }
}

impl Drop for OpenSubscriptionInfo<'_> {
    fn drop(&mut self) {
        let base = self.info.base();
        let mut info = std::mem::replace(&mut self.info, SubscriptionInfo::new(base, 0));
        let mut actions = Vec::new();
        info.evaluate(&self.manager.evaluation(), &mut actions);
        if !info.is_empty() {
            self.table.infos.insert(base, info);
        }
        let manager = self.manager;
        MutexGuard::unlocked(&mut self.table, || manager.execute(actions));
    }
}
