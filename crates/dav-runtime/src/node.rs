//! Distributor node - wires the components of one distributor together

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use dav_core::{DavError, DavResult, DistributorId};
use dav_crypto::VerifierStore;
use dav_transport::TelegramListener;

use crate::{
    AccessControl, AllowAll, BestWayRouter, ConnectionManager, ConnectionStatus, DistributorConfig, IgnoreLists,
    ListsHandler, NodeCounters, NodeStats, PeerContext, PeerSettings, PotentialCentralDistributors,
    ReachableDistributors, RouteChangeListener, RouteLookup, SubscriptionManager,
};

/// Pause after a failed accept
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Optional collaborators of a node
pub struct NodeBuilder {
    config: DistributorConfig,
    listener: Option<std::net::TcpListener>,
    store: Option<Arc<dyn VerifierStore>>,
    lists: Arc<dyn ListsHandler>,
    access: Arc<dyn AccessControl>,
    centrals: Option<Arc<dyn PotentialCentralDistributors>>,
}

impl NodeBuilder {
    /// Listen on an already bound socket instead of the configured address
    pub fn listener(mut self, listener: std::net::TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Users allowed to log in, instead of the configured accounts
    pub fn verifier_store(mut self, store: Arc<dyn VerifierStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lists_handler(mut self, lists: Arc<dyn ListsHandler>) -> Self {
        self.lists = lists;
        self
    }

    pub fn access_control(mut self, access: Arc<dyn AccessControl>) -> Self {
        self.access = access;
        self
    }

    pub fn potential_centrals(mut self, centrals: Arc<dyn PotentialCentralDistributors>) -> Self {
        self.centrals = Some(centrals);
        self
    }

    /// Validate, listen and start connecting
    pub async fn start(self) -> DavResult<Arc<DistributorNode>> {
        let config = self.config;
        config.validate()?;
        let topology = config.topology()?;
        let local = config.local_id();

        let listener = match self.listener {
            Some(listener) => TelegramListener::from_std(listener, config.channel_config())?,
            None => {
                let address = match config.listen_address {
                    Some(address) => address,
                    None => topology
                        .local_endpoint()
                        .map(|ep| SocketAddr::from(([0, 0, 0, 0], ep.subaddress)))
                        .ok_or_else(|| {
                            DavError::InvalidConfig(format!("no listen address for distributor {}", local))
                        })?,
                };
                TelegramListener::bind(address, config.channel_config()).await?
            }
        };
        let store = match self.store {
            Some(store) => store,
            None => config.credential_store()? as Arc<dyn VerifierStore>,
        };

        let counters = Arc::new(NodeCounters::new());
        let router = Arc::new(BestWayRouter::new(local));
        let routes: Arc<dyn RouteLookup> = router.clone();
        let centrals = self
            .centrals
            .unwrap_or_else(|| Arc::new(ReachableDistributors::new(routes.clone())));
        let subscriptions = Arc::new(SubscriptionManager::new(local, routes, centrals, self.access));
        router.add_listener(Arc::downgrade(&subscriptions) as Weak<dyn RouteChangeListener>);

        let context = Arc::new(PeerContext::new(PeerSettings::from_config(&config), store, counters.clone()));
        let connections = ConnectionManager::new(
            &config,
            topology,
            context,
            router.clone(),
            subscriptions.clone(),
            self.lists,
        );

        let local_addr = listener.local_addr();
        tracing::info!(
            distributor = %local,
            "listening on {}, {} outgoing links",
            local_addr,
            connections.topology().outgoing_primary().count()
        );
        let accept_task = tokio::spawn(accept_loop(listener, Arc::downgrade(&connections)));
        connections.start();

        Ok(Arc::new(DistributorNode {
            config,
            local_addr,
            counters,
            router,
            subscriptions,
            connections,
            accept_task: Mutex::new(Some(accept_task)),
            started: Instant::now(),
        }))
    }
}

async fn accept_loop(listener: TelegramListener, connections: Weak<ConnectionManager>) {
    loop {
        let accepted = listener.accept().await;
        let Some(connections) = connections.upgrade() else {
            break;
        };
        match accepted {
            Ok((channel, events)) => {
                if connections.accept(channel, events).is_none() {
                    break;
                }
            }
            Err(e) => {
                if connections.is_closing() {
                    break;
                }
                tracing::warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    tracing::debug!("accept loop ended");
}

/// One running distributor
pub struct DistributorNode {
    config: DistributorConfig,
    local_addr: SocketAddr,
    counters: Arc<NodeCounters>,
    router: Arc<BestWayRouter>,
    subscriptions: Arc<SubscriptionManager>,
    connections: Arc<ConnectionManager>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    started: Instant,
}

impl DistributorNode {
    pub fn builder(config: DistributorConfig) -> NodeBuilder {
        NodeBuilder {
            config,
            listener: None,
            store: None,
            lists: Arc::new(IgnoreLists),
            access: Arc::new(AllowAll),
            centrals: None,
        }
    }

    /// Start with default collaborators
    pub async fn start(config: DistributorConfig) -> DavResult<Arc<Self>> {
        Self::builder(config).start().await
    }

    pub fn local_id(&self) -> DistributorId {
        self.config.local_id()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<BestWayRouter> {
        &self.router
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn stats(&self) -> NodeStats {
        self.counters.snapshot()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn connection_states(&self) -> Vec<ConnectionStatus> {
        self.connections.connection_states()
    }

    /// Hot reload of the disabled neighbours
    pub fn set_disabled_distributors(&self, disabled: impl IntoIterator<Item = DistributorId>) {
        self.connections.set_disabled_distributors(disabled)
    }

    pub async fn terminate_connections(&self, targets: &[DistributorId], delay: Duration) {
        self.connections.terminate_connections(targets, delay).await
    }

    /// Stop accepting and end every link
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.connections.shutdown("distributor shutting down");
        tracing::info!(distributor = %self.local_id(), "shut down after {}", humantime::format_duration(self.uptime()));
    }
}

impl Drop for DistributorNode {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use dav_core::{CommunicationState, UserId};
    use dav_crypto::CredentialStore;

    use crate::{AccountConfig, EdgeConfig, EdgeKind, Endpoint, LoginConfig, TransmitterLink};

    fn bind() -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn endpoint(id: u64, port: u16) -> Endpoint {
        Endpoint {
            id,
            host: "127.0.0.1".into(),
            subaddress: port,
        }
    }

    fn config(local: u64, edges: Vec<EdgeConfig>) -> DistributorConfig {
        DistributorConfig {
            distributor_id: local,
            reconnect_delay: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(5),
            connect_window: Duration::from_secs(1),
            disabled_grace: Duration::from_millis(200),
            login: Some(LoginConfig {
                user: "mesh".into(),
                password: "mesh-secret".into(),
            }),
            accounts: vec![AccountConfig {
                user: "mesh".into(),
                id: 77,
                password: "mesh-secret".into(),
                one_time_passwords: vec![],
            }],
            topology: edges,
            ..DistributorConfig::default()
        }
    }

    fn edge(from: (u64, u16), to: (u64, u16)) -> EdgeConfig {
        EdgeConfig {
            from: endpoint(from.0, from.1),
            to: endpoint(to.0, to.1),
            weight: 2,
            kind: EdgeKind::Primary,
            replacements: vec![],
            auto_replacement: false,
            user: None,
        }
    }

    fn state(node: &DistributorNode, remote: u64) -> CommunicationState {
        node.connection_states()
            .into_iter()
            .find(|s| s.distributor == DistributorId::new(remote))
            .map(|s| s.state)
            .unwrap()
    }

    async fn eventually(what: &str, check: impl Fn() -> bool) {
        for _ in 0..1000 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    async fn pair() -> (Arc<DistributorNode>, Arc<DistributorNode>) {
        let (l1, p1) = bind();
        let (l2, p2) = bind();
        let edges = vec![edge((1, p1), (2, p2))];
        let listening = DistributorNode::builder(config(2, edges.clone()))
            .listener(l2)
            .start()
            .await
            .unwrap();
        let connecting = DistributorNode::builder(config(1, edges))
            .listener(l1)
            .start()
            .await
            .unwrap();
        (connecting, listening)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_link_comes_up() {
        let (n1, n2) = pair().await;
        eventually("link up", || {
            state(&n1, 2) == CommunicationState::Connected && state(&n2, 1) == CommunicationState::Connected
        })
        .await;

        let link = n1.connections().connection(DistributorId::new(2)).unwrap();
        assert!(link.is_encrypted());
        eventually("route", || n1.router().best_way(DistributorId::new(2)).is_some()).await;
        assert_eq!(n1.router().cost(DistributorId::new(2)), Some(2));
        assert_eq!(n2.connections().connection(DistributorId::new(1)).map(|c| c.user_id()), Some(UserId::new(77)));
        assert_eq!(n1.stats().connections_established, 1);

        n1.shutdown();
        n2.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disable_and_enable() {
        let (n1, n2) = pair().await;
        eventually("link up", || state(&n1, 2) == CommunicationState::Connected).await;

        n1.set_disabled_distributors([DistributorId::new(2)]);
        eventually("link down", || state(&n1, 2) == CommunicationState::Disabled).await;
        eventually("remote sees link down", || state(&n2, 1) != CommunicationState::Connected).await;

        n1.set_disabled_distributors([]);
        eventually("link back", || state(&n1, 2) == CommunicationState::Connected).await;

        n1.shutdown();
        n2.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconnect_after_termination() {
        let (n1, n2) = pair().await;
        eventually("link up", || state(&n2, 1) == CommunicationState::Connected).await;
        let first = n1.connections().connection(DistributorId::new(2)).unwrap().id();

        n2.terminate_connections(&[DistributorId::new(1)], Duration::ZERO).await;
        eventually("new link", || {
            n1.connections()
                .connection(DistributorId::new(2))
                .map_or(false, |c| c.id() != first && c.is_initialised())
        })
        .await;
        assert!(n1.stats().reconnect_attempts >= 1);

        n1.shutdown();
        n2.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_wrong_password_never_connects() {
        let (l1, p1) = bind();
        let (l2, p2) = bind();
        let edges = vec![edge((1, p1), (2, p2))];
        let store = CredentialStore::new();
        store.add_user("mesh", UserId::new(77), "other-secret");
        let n2 = DistributorNode::builder(config(2, edges.clone()))
            .listener(l2)
            .verifier_store(Arc::new(store))
            .start()
            .await
            .unwrap();
        let n1 = DistributorNode::builder(config(1, edges)).listener(l1).start().await.unwrap();

        eventually("failed login", || n1.stats().authentication_failures >= 1).await;
        assert!(n1.connections().connection(DistributorId::new(2)).is_none());
        assert_ne!(state(&n2, 1), CommunicationState::Connected);

        n1.shutdown();
        n2.shutdown();
    }

    #[tokio::test]
    async fn test_missing_listen_address() {
        let result = DistributorNode::start(config(1, vec![])).await;
        assert!(matches!(result, Err(DavError::InvalidConfig(_))));
    }
}
