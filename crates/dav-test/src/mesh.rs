//! Local mesh of real distributors
//!
//! Every distributor gets a loopback listener as soon as the mesh is
//! created, so the topology can name real ports before any node runs.
//! A distributor that is not started yet keeps its listener bound but
//! never accepts; neighbours connecting to it time out in the handshake.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dav_core::{DavError, DavResult, DistributorId};
use dav_runtime::{
    AccountConfig, DistributorConfig, DistributorNode, EdgeConfig, EdgeKind, Endpoint, LoginConfig,
};

use crate::oracle::shortest_paths;

pub const MESH_USER: &str = "mesh";
pub const MESH_PASSWORD: &str = "mesh-secret";
pub const MESH_USER_ID: u64 = 77;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Configuration shared by every distributor of a local mesh: short
/// timers and one account all distributors log in with
pub fn mesh_config() -> DistributorConfig {
    DistributorConfig {
        reconnect_delay: Duration::from_secs(1),
        handshake_timeout: Duration::from_secs(1),
        connect_window: Duration::from_secs(1),
        disabled_grace: Duration::from_millis(200),
        login: Some(LoginConfig {
            user: MESH_USER.into(),
            password: MESH_PASSWORD.into(),
        }),
        accounts: vec![AccountConfig {
            user: MESH_USER.into(),
            id: MESH_USER_ID,
            password: MESH_PASSWORD.into(),
            one_time_passwords: vec![],
        }],
        ..DistributorConfig::default()
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) -> DavResult<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(DavError::Timeout(format!("{} not reached within {:?}", what, timeout)));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Several distributors on loopback, sharing one topology
pub struct LocalMesh {
    template: DistributorConfig,
    ports: BTreeMap<u64, u16>,
    listeners: BTreeMap<u64, TcpListener>,
    edges: Vec<EdgeConfig>,
    nodes: BTreeMap<u64, Arc<DistributorNode>>,
}

impl LocalMesh {
    /// Bind a listener for each of `ids`
    pub fn new(ids: impl IntoIterator<Item = u64>) -> DavResult<Self> {
        let mut ports = BTreeMap::new();
        let mut listeners = BTreeMap::new();
        for id in ids {
            let listener =
                TcpListener::bind("127.0.0.1:0").map_err(|e| DavError::TransportError(e.to_string()))?;
            let port = listener
                .local_addr()
                .map_err(|e| DavError::TransportError(e.to_string()))?
                .port();
            ports.insert(id, port);
            listeners.insert(id, listener);
        }
        Ok(LocalMesh {
            template: mesh_config(),
            ports,
            listeners,
            edges: Vec::new(),
            nodes: BTreeMap::new(),
        })
    }

    /// Change the configuration used for distributors started afterwards
    pub fn configure(&mut self, f: impl FnOnce(&mut DistributorConfig)) -> &mut Self {
        f(&mut self.template);
        self
    }

    /// Primary edge; `from` connects to `to`
    pub fn edge(&mut self, from: u64, to: u64, weight: u32) -> &mut Self {
        self.push_edge(from, to, weight, EdgeKind::Primary)
    }

    /// Replacement edge, only used while a primary edge of `from` is down
    pub fn replacement_edge(&mut self, from: u64, to: u64, weight: u32) -> &mut Self {
        self.push_edge(from, to, weight, EdgeKind::Replacement)
    }

    /// Name the replacement distributors of the primary edge `from` -> `to`
    pub fn with_replacements(&mut self, from: u64, to: u64, replacements: &[u64]) -> &mut Self {
        if let Some(edge) = self
            .edges
            .iter_mut()
            .find(|e| e.from.id == from && e.to.id == to && e.kind == EdgeKind::Primary)
        {
            edge.replacements = replacements.to_vec();
        }
        self
    }

    fn push_edge(&mut self, from: u64, to: u64, weight: u32, kind: EdgeKind) -> &mut Self {
        self.edges.push(EdgeConfig {
            from: self.endpoint(from),
            to: self.endpoint(to),
            weight,
            kind,
            replacements: vec![],
            auto_replacement: false,
            user: None,
        });
        self
    }

    fn endpoint(&self, id: u64) -> Endpoint {
        Endpoint {
            id,
            host: "127.0.0.1".into(),
            // Ids without a listener get port 0 and are never reachable
            subaddress: self.ports.get(&id).copied().unwrap_or(0),
        }
    }

    pub fn config_for(&self, id: u64) -> DistributorConfig {
        DistributorConfig {
            distributor_id: id,
            topology: self.edges.clone(),
            ..self.template.clone()
        }
    }

    /// Start distributor `id` on its reserved listener
    pub async fn start(&mut self, id: u64) -> DavResult<Arc<DistributorNode>> {
        let listener = self
            .listeners
            .remove(&id)
            .ok_or(DavError::UnknownDistributor(DistributorId::new(id)))?;
        let node = DistributorNode::builder(self.config_for(id))
            .listener(listener)
            .start()
            .await?;
        tracing::debug!(distributor = id, "mesh node started on {}", node.local_addr());
        self.nodes.insert(id, node.clone());
        Ok(node)
    }

    pub async fn start_all(&mut self) -> DavResult<()> {
        let pending: Vec<u64> = self.listeners.keys().copied().collect();
        for id in pending {
            self.start(id).await?;
        }
        Ok(())
    }

    pub fn node(&self, id: u64) -> Option<&Arc<DistributorNode>> {
        self.nodes.get(&id)
    }

    /// Whether every running distributor routes to every other one at the
    /// cost of the cheapest path over primary edges between running nodes
    pub fn routes_converged(&self) -> bool {
        let running: Vec<(DistributorId, DistributorId, u32)> = self
            .edges
            .iter()
            .filter(|e| e.kind == EdgeKind::Primary)
            .filter(|e| self.nodes.contains_key(&e.from.id) && self.nodes.contains_key(&e.to.id))
            .map(|e| (e.from.distributor(), e.to.distributor(), e.weight))
            .collect();
        let oracle = shortest_paths(self.nodes.keys().map(|id| DistributorId::new(*id)), &running);
        self.nodes.values().all(|node| {
            self.nodes.values().all(|other| {
                let (a, b) = (node.local_id(), other.local_id());
                a == b || oracle.cost(a, b) == node.router().cost(b).map(u64::from)
            })
        })
    }

    pub async fn wait_converged(&self, timeout: Duration) -> DavResult<()> {
        wait_until("route convergence", timeout, || self.routes_converged()).await
    }

    pub fn shutdown(&self) {
        for node in self.nodes.values() {
            node.shutdown();
        }
    }
}

impl Drop for LocalMesh {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    use dav_core::{BaseSubscriptionInfo, CommunicationState, ReceiverState, UserId};
    use dav_runtime::{EncryptionPolicy, LocalRole, LocalSubscriber};

    const WAIT: Duration = Duration::from_secs(15);

    #[derive(Default)]
    struct Recorder {
        data: Mutex<Vec<(u64, Bytes)>>,
        receiver: Mutex<Option<ReceiverState>>,
    }

    impl LocalSubscriber for Recorder {
        fn data(&self, _info: BaseSubscriptionInfo, data_index: u64, payload: Bytes) {
            self.data.lock().push((data_index, payload));
        }

        fn receiver_state(&self, _info: BaseSubscriptionInfo, state: ReceiverState) {
            *self.receiver.lock() = Some(state);
        }
    }

    fn state(node: &DistributorNode, remote: u64) -> CommunicationState {
        node.connection_states()
            .into_iter()
            .find(|s| s.distributor == DistributorId::new(remote))
            .map_or(CommunicationState::NotRelevant, |s| s.state)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_routes_follow_cheapest_path() {
        let mut mesh = LocalMesh::new([1, 2, 3]).unwrap();
        mesh.configure(|c| c.encryption = EncryptionPolicy::AllowDisableOnLoopback);
        mesh.edge(1, 2, 2).edge(2, 3, 3).edge(1, 3, 10);
        mesh.start_all().await.unwrap();
        mesh.wait_converged(WAIT).await.unwrap();

        let n1 = mesh.node(1).unwrap();
        assert_eq!(n1.router().cost(DistributorId::new(3)), Some(5));
        assert_eq!(n1.router().best_way(DistributorId::new(3)), Some(DistributorId::new(2)));

        // Loopback links drop their encryption after login
        let link = n1.connections().connection(DistributorId::new(2)).unwrap();
        wait_until("plain link", WAIT, || !link.is_encrypted()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_data_crosses_the_mesh() {
        let mut mesh = LocalMesh::new([1, 2, 3]).unwrap();
        mesh.edge(1, 2, 1).edge(2, 3, 1);
        mesh.start_all().await.unwrap();
        mesh.wait_converged(WAIT).await.unwrap();

        let info = BaseSubscriptionInfo::new(5, 40, 1);
        let source = mesh
            .node(1)
            .unwrap()
            .subscriptions()
            .subscribe_local(info, LocalRole::Source, UserId::SYSTEM, Arc::new(Recorder::default()))
            .unwrap();
        let receiver = Arc::new(Recorder::default());
        mesh.node(3)
            .unwrap()
            .subscriptions()
            .subscribe_local(info, LocalRole::Receiver, UserId::SYSTEM, receiver.clone())
            .unwrap();
        wait_until("source found", WAIT, || {
            *receiver.receiver.lock() == Some(ReceiverState::SendersAvailable)
        })
        .await
        .unwrap();

        // Large enough to travel as several fragments
        let payload = Bytes::from((0..10_000u32).map(|i| i as u8).collect::<Vec<u8>>());
        let index = mesh
            .node(1)
            .unwrap()
            .subscriptions()
            .publish(info, source, payload.clone())
            .unwrap();
        wait_until("data delivered", WAIT, || !receiver.data.lock().is_empty())
            .await
            .unwrap();
        assert_eq!(receiver.data.lock().clone(), vec![(index, payload)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replacement_link_stands_in() {
        let mut mesh = LocalMesh::new([1, 2, 3]).unwrap();
        mesh.edge(1, 2, 1)
            .replacement_edge(1, 3, 5)
            .with_replacements(1, 2, &[3]);

        // 2 stays down, so 1 falls back to its replacement link
        mesh.start(3).await.unwrap();
        mesh.start(1).await.unwrap();
        let n1 = mesh.node(1).unwrap().clone();
        wait_until("replacement link", WAIT, || state(&n1, 3) == CommunicationState::Connected)
            .await
            .unwrap();

        mesh.start(2).await.unwrap();
        wait_until("primary link", WAIT, || state(&n1, 2) == CommunicationState::Connected)
            .await
            .unwrap();
        wait_until("replacement released", WAIT, || {
            state(&n1, 3) == CommunicationState::UnusedReplacementConnection
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_node_not_started() {
        let mut mesh = LocalMesh::new([1]).unwrap();
        let result = mesh.start(4).await;
        assert!(matches!(result, Err(DavError::UnknownDistributor(_))));
        assert!(mesh.routes_converged());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let result = wait_until("never", Duration::from_millis(30), || false).await;
        assert!(matches!(result, Err(DavError::Timeout(_))));
    }
}
