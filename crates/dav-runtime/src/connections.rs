//! Connection lifecycle
//!
//! The [`ConnectionManager`] owns every peer connection of a distributor. It
//! keeps the outgoing primary edges of the topology up, brings replacement
//! links up while a primary link is down, and feeds established links into
//! routing and subscriptions.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use dav_core::{CommunicationState, ConnectionId, DavError, DavResult, DistributorId, LinkDirection};
use dav_crypto::ClientCredentials;
use dav_transport::{ChannelConfig, ChannelEvents, StreamChannel, TelegramChannel};
use dav_wire::{DataTelegram, Telegram};

use crate::{
    BestWayRouter, DistributorConfig, EdgeKind, ListsHandler, NodeCounters, PeerConnection, PeerContext, PeerHost,
    PeerStatus, Relevance, SubscriptionManager, Topology, TopologyEdge, TransmitterLink,
};

/// Status of the link to one configured distributor
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub distributor: DistributorId,
    pub state: CommunicationState,
    pub address: Option<SocketAddr>,
    pub encrypted: bool,
    pub message: Option<String>,
}

impl ConnectionStatus {
    fn quiet(distributor: DistributorId, state: CommunicationState) -> Self {
        ConnectionStatus {
            distributor,
            state,
            address: None,
            encrypted: false,
            message: None,
        }
    }

    fn from_peer(distributor: DistributorId, status: PeerStatus) -> Self {
        ConnectionStatus {
            distributor,
            state: status.state,
            address: status.address,
            encrypted: status.encrypted,
            message: status.message,
        }
    }
}

/// Timing of connect attempts
#[derive(Clone, Debug)]
pub struct LifecycleSettings {
    pub reconnect_delay: Duration,
    pub connect_window: Duration,
    pub max_parallel_connects: usize,
    pub channel: ChannelConfig,
}

impl LifecycleSettings {
    pub fn from_config(config: &DistributorConfig) -> Self {
        LifecycleSettings {
            reconnect_delay: config.reconnect_delay,
            connect_window: config.effective_connect_window(),
            max_parallel_connects: config.max_parallel_connects,
            channel: config.channel_config(),
        }
    }
}

#[derive(Default)]
struct ConnectionTable {
    /// Authenticated connections by remote id
    by_id: HashMap<DistributorId, Arc<PeerConnection>>,
    /// Connections still in the handshake
    pending: HashMap<ConnectionId, Arc<PeerConnection>>,
    /// Last status of ended connections
    ended: HashMap<DistributorId, PeerStatus>,
    disabled: BTreeSet<DistributorId>,
    /// Targets of replacement links currently wanted
    active_replacements: HashSet<DistributorId>,
    reconnects: HashMap<DistributorId, JoinHandle<()>>,
}

/// Owns the peer connections of one distributor
pub struct ConnectionManager {
    this: Weak<ConnectionManager>,
    local: DistributorId,
    topology: Topology,
    settings: LifecycleSettings,
    login: Option<ClientCredentials>,
    edge_logins: HashMap<String, ClientCredentials>,
    context: Arc<PeerContext>,
    router: Arc<BestWayRouter>,
    subscriptions: Arc<SubscriptionManager>,
    lists: Arc<dyn ListsHandler>,
    counters: Arc<NodeCounters>,
    table: Mutex<ConnectionTable>,
    connect_permits: Arc<Semaphore>,
    closing: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: &DistributorConfig,
        topology: Topology,
        context: Arc<PeerContext>,
        router: Arc<BestWayRouter>,
        subscriptions: Arc<SubscriptionManager>,
        lists: Arc<dyn ListsHandler>,
    ) -> Arc<Self> {
        let settings = LifecycleSettings::from_config(config);
        let edge_logins = topology
            .edges()
            .iter()
            .filter_map(|e| e.user.as_deref())
            .filter_map(|user| config.credentials_for(Some(user)).map(|c| (user.to_string(), c)))
            .collect();
        let disabled = config.disabled_distributors().into_iter().collect();
        let counters = context.counters().clone();
        Arc::new_cyclic(|this| ConnectionManager {
            this: this.clone(),
            local: config.local_id(),
            topology,
            connect_permits: Arc::new(Semaphore::new(settings.max_parallel_connects)),
            settings,
            login: config.credentials_for(None),
            edge_logins,
            context,
            router,
            subscriptions,
            lists,
            counters,
            table: Mutex::new(ConnectionTable {
                disabled,
                ..ConnectionTable::default()
            }),
            closing: AtomicBool::new(false),
        })
    }

    pub fn local_id(&self) -> DistributorId {
        self.local
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Start connecting along every outgoing primary edge
    pub fn start(self: &Arc<Self>) {
        for edge in self.topology.outgoing_primary() {
            let manager = self.clone();
            let edge = edge.clone();
            tokio::spawn(async move { manager.maintain_edge(edge).await });
        }
    }

    /// Take over an accepted link
    pub fn accept(
        self: &Arc<Self>,
        channel: Arc<dyn TelegramChannel>,
        events: ChannelEvents,
    ) -> Option<Arc<PeerConnection>> {
        if self.is_closing() {
            channel.close();
            return None;
        }
        tracing::debug!(address = ?channel.remote_addr(), "incoming link");
        let connection =
            PeerConnection::start(self.context.clone(), self.host(), channel, events, LinkDirection::Incoming);
        self.table.lock().pending.insert(connection.id(), connection.clone());
        Some(connection)
    }

    /// Authenticated connection to `remote`
    pub fn connection(&self, remote: DistributorId) -> Option<Arc<PeerConnection>> {
        self.table.lock().by_id.get(&remote).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<PeerConnection>> {
        self.table.lock().by_id.values().cloned().collect()
    }

    pub fn disabled_distributors(&self) -> BTreeSet<DistributorId> {
        self.table.lock().disabled.clone()
    }

    /// Replace the set of disabled distributors
    pub fn set_disabled_distributors(&self, disabled: impl IntoIterator<Item = DistributorId>) {
        let new: BTreeSet<DistributorId> = disabled.into_iter().collect();
        let old = self.disabled_distributors();
        for id in new.difference(&old) {
            self.disable_connection(*id);
        }
        for id in old.difference(&new) {
            self.enable_connection(*id);
        }
    }

    pub fn disable_connection(&self, remote: DistributorId) {
        let (connection, reconnect) = {
            let mut table = self.table.lock();
            if !table.disabled.insert(remote) {
                return;
            }
            (table.by_id.get(&remote).cloned(), table.reconnects.remove(&remote))
        };
        tracing::info!(remote = %remote, "link disabled");
        if let Some(task) = reconnect {
            task.abort();
        }
        if let Some(connection) = connection {
            connection.terminate(true, "connection disabled");
        }
    }

    pub fn enable_connection(&self, remote: DistributorId) {
        if !self.table.lock().disabled.remove(&remote) {
            return;
        }
        tracing::info!(remote = %remote, "link enabled");
        if let Some(edge) = self.topology.outgoing_edge(remote, EdgeKind::Primary) {
            self.schedule_reconnect(edge.clone(), Duration::ZERO);
        }
    }

    /// Status of every configured distributor except this one
    pub fn connection_states(&self) -> Vec<ConnectionStatus> {
        let table = self.table.lock();
        self.topology
            .distributors()
            .into_iter()
            .map(|id| self.status_of(&table, id))
            .collect()
    }

    fn status_of(&self, table: &ConnectionTable, id: DistributorId) -> ConnectionStatus {
        let live = table
            .by_id
            .get(&id)
            .or_else(|| table.pending.values().find(|c| c.remote() == Some(id)));
        if let Some(connection) = live {
            return ConnectionStatus::from_peer(id, connection.status());
        }
        if table.disabled.contains(&id) {
            return ConnectionStatus::quiet(id, CommunicationState::Disabled);
        }
        let quiet = match self.topology.relevance(id) {
            Relevance::NotRelevant => CommunicationState::NotRelevant,
            Relevance::Listens(_) => CommunicationState::Listening,
            Relevance::Connects(edge) if edge.is_replacement() && !table.active_replacements.contains(&id) => {
                CommunicationState::UnusedReplacementConnection
            }
            Relevance::Connects(_) => CommunicationState::NotConnected,
        };
        match table.ended.get(&id) {
            Some(last) if last.state == CommunicationState::Error => ConnectionStatus {
                state: CommunicationState::Error,
                message: last.message.clone(),
                ..ConnectionStatus::quiet(id, quiet)
            },
            Some(last) => ConnectionStatus {
                message: last.message.clone(),
                ..ConnectionStatus::quiet(id, quiet)
            },
            None => ConnectionStatus::quiet(id, quiet),
        }
    }

    /// Terminate the links to `targets` one after another
    pub async fn terminate_connections(&self, targets: &[DistributorId], delay: Duration) {
        for (i, target) in targets.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            match self.connection(*target) {
                Some(connection) => connection.terminate(true, "terminated by administrative order"),
                None => tracing::debug!(remote = %target, "no connection to terminate"),
            }
        }
    }

    /// Stop reconnecting and end every link
    pub fn shutdown(&self, reason: &str) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        let (connections, reconnects) = {
            let mut table = self.table.lock();
            let connections: Vec<_> = table
                .by_id
                .values()
                .chain(table.pending.values())
                .cloned()
                .collect();
            let reconnects: Vec<_> = table.reconnects.drain().map(|(_, task)| task).collect();
            (connections, reconnects)
        };
        for task in reconnects {
            task.abort();
        }
        tracing::info!("closing {} connections: {}", connections.len(), reason);
        for connection in connections {
            connection.terminate(false, reason);
        }
    }

    // Outgoing links

    /// One round for a primary edge: connect, or bring up its replacements
    /// and try again later
    async fn maintain_edge(self: Arc<Self>, edge: TopologyEdge) {
        if self.is_closing() {
            return;
        }
        match self.connect_edge(&edge).await {
            EdgeLink::Up => self.release_replacements(&edge),
            // Enabling the distributor again schedules the next attempt
            EdgeLink::Disabled => self.activate_replacements(&edge).await,
            EdgeLink::Down => {
                self.activate_replacements(&edge).await;
                self.schedule_reconnect(edge, self.settings.reconnect_delay);
            }
        }
    }

    fn schedule_reconnect(&self, edge: TopologyEdge, delay: Duration) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        if self.is_closing() {
            return;
        }
        self.counters.reconnect_attempt();
        let remote = edge.to_id();
        tracing::debug!(remote = %remote, "next connect attempt in {}", humantime::format_duration(delay));
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            manager.maintain_edge(edge).await;
        });
        self.table.lock().reconnects.insert(remote, task);
    }

    /// Keep trying `edge` within the connect window
    async fn connect_edge(self: &Arc<Self>, edge: &TopologyEdge) -> EdgeLink {
        let remote = edge.to_id();
        let started = Instant::now();
        loop {
            if self.is_closing() {
                return EdgeLink::Down;
            }
            {
                let table = self.table.lock();
                if table.disabled.contains(&remote) {
                    return EdgeLink::Disabled;
                }
                if table.by_id.get(&remote).map_or(false, |c| !c.is_terminated()) {
                    return EdgeLink::Up;
                }
            }
            match self.connect_once(edge).await {
                Ok(()) => {
                    tracing::info!(remote = %remote, "connected to {}", edge.to.address());
                    return EdgeLink::Up;
                }
                Err(e) => {
                    tracing::warn!(remote = %remote, "connection to {} failed: {}", edge.to.address(), e);
                }
            }
            if started.elapsed() >= self.settings.connect_window {
                return EdgeLink::Down;
            }
            tokio::time::sleep(self.settings.reconnect_delay).await;
        }
    }

    async fn connect_once(self: &Arc<Self>, edge: &TopologyEdge) -> DavResult<()> {
        let remote = edge.to_id();
        let _permit = self
            .connect_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| DavError::ConnectionTerminated("distributor shutting down".into()))?;

        let address = resolve(&edge.to.address()).await?;
        let duplicate = self.table.lock().by_id.values().any(|c| {
            !c.is_terminated() && c.direction() == LinkDirection::Outgoing && c.remote_addr() == Some(address)
        });
        if duplicate {
            tracing::debug!(remote = %remote, "already connected to {}", address);
            return Ok(());
        }

        let (channel, events) = StreamChannel::connect(address, &self.settings.channel).await?;
        let connection =
            PeerConnection::start(self.context.clone(), self.host(), channel, events, LinkDirection::Outgoing);
        self.table.lock().pending.insert(connection.id(), connection.clone());
        match connection.establish(remote).await {
            Ok(_) => Ok(()),
            Err(e) => {
                connection.terminate(true, &e.to_string());
                Err(e)
            }
        }
    }

    async fn activate_replacements(self: &Arc<Self>, primary: &TopologyEdge) {
        let replacements: Vec<TopologyEdge> = self.topology.replacements_for(primary).into_iter().cloned().collect();
        for edge in replacements {
            let newly = self.table.lock().active_replacements.insert(edge.to_id());
            if newly {
                tracing::info!(remote = %edge.to_id(), "replacement link for {} wanted", primary.to_id());
            }
            self.connect_edge(&edge).await;
        }
    }

    fn release_replacements(&self, primary: &TopologyEdge) {
        for edge in self.topology.replacements_for(primary) {
            let remote = edge.to_id();
            let connection = {
                let mut table = self.table.lock();
                if !table.active_replacements.remove(&remote) {
                    continue;
                }
                table.by_id.get(&remote).cloned()
            };
            if let Some(connection) = connection {
                if connection.direction() == LinkDirection::Outgoing {
                    connection.terminate(false, "replacement connection no longer needed, primary link restored");
                }
            }
        }
    }

    fn host(&self) -> Weak<dyn PeerHost> {
        self.this.clone() as Weak<dyn PeerHost>
    }

    fn link(connection: &Arc<PeerConnection>) -> Arc<dyn TransmitterLink> {
        connection.clone() as Arc<dyn TransmitterLink>
    }
}

/// Outcome of the attempts on one edge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum EdgeLink {
    Up,
    Disabled,
    Down,
}

async fn resolve(address: &str) -> DavResult<SocketAddr> {
    tokio::net::lookup_host(address)
        .await
        .map_err(|e| DavError::TransportError(format!("{}: {}", address, e)))?
        .next()
        .ok_or_else(|| DavError::TransportError(format!("{} does not resolve", address)))
}

impl PeerHost for ConnectionManager {
    fn claim_identity(&self, connection: &Arc<PeerConnection>, remote: DistributorId) -> Result<(), String> {
        if remote == self.local {
            return Err(format!("distributor {} connected to itself", remote));
        }
        if self.is_closing() {
            return Err("distributor shutting down".to_string());
        }
        let mut table = self.table.lock();
        if let Some(existing) = table.by_id.get(&remote) {
            if existing.id() != connection.id() && !existing.is_terminated() {
                return Err(format!(
                    "distributor {} is already connected ({})",
                    remote,
                    existing.id()
                ));
            }
        }
        table.pending.remove(&connection.id());
        table.ended.remove(&remote);
        table.by_id.insert(remote, connection.clone());
        Ok(())
    }

    fn is_disabled(&self, remote: DistributorId) -> bool {
        self.table.lock().disabled.contains(&remote)
    }

    fn weight_for(&self, remote: DistributorId) -> u32 {
        self.topology.weight_to(remote)
    }

    fn credentials_for(&self, remote: DistributorId) -> Option<ClientCredentials> {
        match self.topology.user_for(remote) {
            Some(user) => self.edge_logins.get(user).cloned(),
            None => self.login.clone(),
        }
    }

    fn ready(&self, connection: &Arc<PeerConnection>) {
        let link = Self::link(connection);
        self.router.add_link(link.clone());
        self.subscriptions.connection_added(&link);
        connection.complete_initialisation();
    }

    fn routed_telegram(&self, connection: &Arc<PeerConnection>, telegram: Telegram) {
        self.counters.telegram_routed();
        let remote = connection.remote_id();
        let link = Self::link(connection);
        match telegram {
            Telegram::BestWayUpdate { updates } => {
                self.router.handle_routing_update(remote, connection.id(), &updates)
            }
            Telegram::Subscription(t) => self.subscriptions.handle_subscription(link, t),
            Telegram::Unsubscription(t) => self.subscriptions.handle_unsubscription(&link, t),
            Telegram::SubscriptionReceipt(t) => self.subscriptions.handle_receipt(&link, t),
            Telegram::ListsSubscription(t) => self.lists.lists_subscription(remote, &t),
            Telegram::ListsUnsubscription(t) => self.lists.lists_unsubscription(remote, &t),
            Telegram::ListsUpdate(t) => self.lists.lists_update(remote, &t),
            other => {
                self.counters.telegram_dropped();
                tracing::debug!(remote = %remote, "{:?} not routable", other.kind());
            }
        }
    }

    fn data_received(&self, connection: &Arc<PeerConnection>, fragments: Vec<DataTelegram>) {
        self.counters.telegram_routed();
        if !self.subscriptions.handle_data(&Self::link(connection), fragments) {
            self.counters.telegram_dropped();
        }
    }

    fn terminated(&self, connection: &Arc<PeerConnection>, error: bool, reason: &str) {
        let remote = {
            let mut table = self.table.lock();
            table.pending.remove(&connection.id());
            // The claim may precede the login result on the connection itself
            let claimed = table
                .by_id
                .iter()
                .find(|(_, c)| c.id() == connection.id())
                .map(|(remote, _)| *remote);
            if let Some(remote) = claimed {
                table.by_id.remove(&remote);
                let mut status = connection.status();
                status.remote = Some(remote);
                status.state = if error {
                    CommunicationState::Error
                } else {
                    CommunicationState::NotConnected
                };
                status.message = Some(reason.to_string());
                table.ended.insert(remote, status);
            }
            claimed.or_else(|| connection.remote())
        };
        let Some(remote) = remote else {
            return;
        };
        self.router.handle_disconnection(remote, connection.id());
        self.subscriptions.connection_removed(connection.id());

        let reconnect = connection.direction() == LinkDirection::Outgoing
            && connection.is_initialised()
            && !self.is_closing()
            && !self.is_disabled(remote);
        if reconnect {
            if let Some(edge) = self.topology.outgoing_edge(remote, EdgeKind::Primary) {
                self.schedule_reconnect(edge.clone(), self.settings.reconnect_delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{EdgeConfig, Endpoint, IgnoreLists, PeerSettings};
    use bytes::Bytes;
    use dav_crypto::CredentialStore;
    use dav_wire::ListsTelegram;

    fn endpoint(id: u64) -> Endpoint {
        Endpoint {
            id,
            host: "127.0.0.1".into(),
            subaddress: 1,
        }
    }

    fn edge(from: u64, to: u64, kind: EdgeKind, replacements: Vec<u64>) -> EdgeConfig {
        EdgeConfig {
            from: endpoint(from),
            to: endpoint(to),
            weight: 1,
            kind,
            replacements,
            auto_replacement: false,
            user: None,
        }
    }

    fn manager(local: u64, edges: Vec<EdgeConfig>, disabled: Vec<u64>) -> Arc<ConnectionManager> {
        manager_with_lists(local, edges, disabled, Arc::new(IgnoreLists))
    }

    fn manager_with_lists(
        local: u64,
        edges: Vec<EdgeConfig>,
        disabled: Vec<u64>,
        lists: Arc<dyn ListsHandler>,
    ) -> Arc<ConnectionManager> {
        let config = DistributorConfig {
            distributor_id: local,
            topology: edges,
            disabled,
            ..DistributorConfig::default()
        };
        let topology = config.topology().unwrap();
        let context = Arc::new(PeerContext::new(
            PeerSettings::from_config(&config),
            Arc::new(CredentialStore::new()),
            Arc::new(NodeCounters::new()),
        ));
        let router = Arc::new(BestWayRouter::new(config.local_id()));
        let subscriptions = Arc::new(SubscriptionManager::with_defaults(config.local_id(), router.clone()));
        ConnectionManager::new(&config, topology, context, router, subscriptions, lists)
    }

    #[derive(Default)]
    struct RecordingLists {
        seen: Mutex<Vec<(&'static str, DistributorId)>>,
    }

    impl ListsHandler for RecordingLists {
        fn lists_subscription(&self, _from: DistributorId, telegram: &ListsTelegram) {
            self.seen.lock().push(("subscription", telegram.distributor));
        }

        fn lists_unsubscription(&self, _from: DistributorId, telegram: &ListsTelegram) {
            self.seen.lock().push(("unsubscription", telegram.distributor));
        }

        fn lists_update(&self, _from: DistributorId, telegram: &ListsTelegram) {
            self.seen.lock().push(("update", telegram.distributor));
        }
    }

    fn id(n: u64) -> DistributorId {
        DistributorId::new(n)
    }

    fn state_of(manager: &ConnectionManager, n: u64) -> CommunicationState {
        manager
            .connection_states()
            .into_iter()
            .find(|s| s.distributor == id(n))
            .map(|s| s.state)
            .unwrap()
    }

    fn unconnected(manager: &Arc<ConnectionManager>) -> Arc<PeerConnection> {
        let (a, _b) = tokio::io::duplex(1024);
        let (channel, events) = StreamChannel::spawn(a, None, &ChannelConfig::default());
        manager.accept(channel, events).unwrap()
    }

    #[tokio::test]
    async fn test_quiet_states() {
        let m = manager(
            1,
            vec![
                edge(1, 2, EdgeKind::Primary, vec![3]),
                edge(1, 3, EdgeKind::Replacement, vec![]),
                edge(4, 1, EdgeKind::Primary, vec![]),
                edge(4, 5, EdgeKind::Primary, vec![]),
                edge(1, 6, EdgeKind::Primary, vec![]),
            ],
            vec![6],
        );
        assert_eq!(m.connection_states().len(), 5);
        assert_eq!(state_of(&m, 2), CommunicationState::NotConnected);
        assert_eq!(state_of(&m, 3), CommunicationState::UnusedReplacementConnection);
        assert_eq!(state_of(&m, 4), CommunicationState::Listening);
        assert_eq!(state_of(&m, 5), CommunicationState::NotRelevant);
        assert_eq!(state_of(&m, 6), CommunicationState::Disabled);

        m.table.lock().active_replacements.insert(id(3));
        assert_eq!(state_of(&m, 3), CommunicationState::NotConnected);
    }

    #[tokio::test]
    async fn test_disabled_set_diff() {
        let m = manager(1, vec![edge(2, 1, EdgeKind::Primary, vec![])], vec![2, 3]);
        m.set_disabled_distributors([id(3), id(4)]);
        assert_eq!(m.disabled_distributors(), BTreeSet::from([id(3), id(4)]));
        assert_eq!(state_of(&m, 2), CommunicationState::Listening);
        assert!(m.is_disabled(id(4)));
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let m = manager(1, vec![edge(2, 1, EdgeKind::Primary, vec![])], vec![]);
        let first = unconnected(&m);
        let second = unconnected(&m);

        assert!(m.claim_identity(&first, id(2)).is_ok());
        assert!(m.claim_identity(&first, id(2)).is_ok());
        let rejected = m.claim_identity(&second, id(2)).unwrap_err();
        assert!(rejected.contains("already connected"), "{}", rejected);
        assert!(m.claim_identity(&second, id(1)).is_err());
        assert_eq!(m.connection(id(2)).map(|c| c.id()), Some(first.id()));

        first.terminate(true, "gone");
        assert!(m.connection(id(2)).is_none());
        assert!(m.claim_identity(&second, id(2)).is_ok());
    }

    #[tokio::test]
    async fn test_claim_released_before_login_completes() {
        let m = manager(1, vec![edge(2, 1, EdgeKind::Primary, vec![])], vec![]);
        let early = unconnected(&m);
        m.claim_identity(&early, id(2)).unwrap();
        assert_eq!(early.remote(), None);

        early.terminate(true, "link setup not completed in time");
        assert!(m.connection(id(2)).is_none());
        assert_eq!(state_of(&m, 2), CommunicationState::Error);

        let next = unconnected(&m);
        assert!(m.claim_identity(&next, id(2)).is_ok());
        assert_eq!(m.connection(id(2)).map(|c| c.id()), Some(next.id()));
    }

    #[tokio::test]
    async fn test_disabled_primary_brings_up_replacements() {
        let m = manager(
            1,
            vec![
                edge(1, 2, EdgeKind::Primary, vec![3]),
                edge(1, 3, EdgeKind::Replacement, vec![]),
            ],
            vec![2, 3],
        );
        let primary = m.topology.outgoing_edge(id(2), EdgeKind::Primary).unwrap().clone();
        assert_eq!(m.connect_edge(&primary).await, EdgeLink::Disabled);

        m.clone().maintain_edge(primary).await;
        let table = m.table.lock();
        assert!(table.active_replacements.contains(&id(3)));
        assert!(table.reconnects.is_empty());
    }

    #[tokio::test]
    async fn test_ended_connection_reported() {
        let m = manager(1, vec![edge(2, 1, EdgeKind::Primary, vec![])], vec![]);
        let connection = unconnected(&m);
        m.claim_identity(&connection, id(2)).unwrap();
        assert_eq!(state_of(&m, 2), CommunicationState::Connecting);

        connection.terminate(true, "keep-alive timeout");
        let status = m
            .connection_states()
            .into_iter()
            .find(|s| s.distributor == id(2))
            .unwrap();
        assert_eq!(status.state, CommunicationState::Error);
        assert_eq!(status.message.as_deref(), Some("keep-alive timeout"));
    }

    #[tokio::test]
    async fn test_shutdown_terminates_pending() {
        let m = manager(1, vec![], vec![]);
        let connection = unconnected(&m);
        m.shutdown("stopping");
        assert!(connection.is_terminated());
        assert!(m.is_closing());
        let (a, _b) = tokio::io::duplex(1024);
        let (channel, events) = StreamChannel::spawn(a, None, &ChannelConfig::default());
        assert!(m.accept(channel, events).is_none());
    }

    #[tokio::test]
    async fn test_credentials_per_edge() {
        let mut e = edge(1, 2, EdgeKind::Primary, vec![]);
        e.user = Some("special".into());
        let config = DistributorConfig {
            distributor_id: 1,
            topology: vec![e, edge(1, 3, EdgeKind::Primary, vec![])],
            login: Some(crate::LoginConfig {
                user: "dav1".into(),
                password: "pw".into(),
            }),
            edge_logins: vec![crate::LoginConfig {
                user: "special".into(),
                password: "secret".into(),
            }],
            ..DistributorConfig::default()
        };
        let topology = config.topology().unwrap();
        let context = Arc::new(PeerContext::new(
            PeerSettings::from_config(&config),
            Arc::new(CredentialStore::new()),
            Arc::new(NodeCounters::new()),
        ));
        let router = Arc::new(BestWayRouter::new(config.local_id()));
        let subscriptions = Arc::new(SubscriptionManager::with_defaults(config.local_id(), router.clone()));
        let m = ConnectionManager::new(&config, topology, context, router, subscriptions, Arc::new(IgnoreLists));

        assert_eq!(m.credentials_for(id(2)).map(|c| c.password), Some("secret".to_string()));
        assert_eq!(m.credentials_for(id(3)).map(|c| c.user), Some("dav1".to_string()));
        assert_eq!(m.weight_for(id(3)), 1);
    }

    #[tokio::test]
    async fn test_lists_telegrams_reach_handler() {
        let lists = Arc::new(RecordingLists::default());
        let m = manager_with_lists(1, vec![edge(2, 1, EdgeKind::Primary, vec![])], vec![], lists.clone());
        let connection = unconnected(&m);
        let lists_telegram = |n| ListsTelegram {
            distributor: id(n),
            payload: Bytes::from_static(b"objects"),
        };

        m.routed_telegram(&connection, Telegram::ListsSubscription(lists_telegram(7)));
        m.routed_telegram(&connection, Telegram::ListsUpdate(lists_telegram(7)));
        m.routed_telegram(&connection, Telegram::ListsUnsubscription(lists_telegram(8)));
        m.routed_telegram(&connection, Telegram::KeepAlive);

        assert_eq!(
            *lists.seen.lock(),
            vec![("subscription", id(7)), ("update", id(7)), ("unsubscription", id(8))]
        );
        assert_eq!(m.counters.snapshot().telegrams_dropped, 1);
    }
}
