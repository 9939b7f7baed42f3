//! Configured links between distributors
//!
//! An edge runs from the distributor that connects (`from`) to the one that
//! listens (`to`). Primary edges are kept up permanently, replacement edges
//! only while a primary edge they stand in for is down.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::Deserialize;

use dav_core::{DavError, DavResult, DistributorId};

/// Weight of a link without a configured edge
pub const DEFAULT_WEIGHT: u32 = 1;

/// Network location of a distributor
#[derive(Clone, Debug, PartialEq, Eq, Hash, Deserialize)]
pub struct Endpoint {
    pub id: u64,
    pub host: String,
    /// TCP port
    pub subaddress: u16,
}

impl Endpoint {
    pub fn distributor(&self) -> DistributorId {
        DistributorId::new(self.id)
    }

    /// `host:port`, resolved at connect time
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.subaddress)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Primary,
    /// Exchange link, only up while a primary link is down
    Replacement,
}

/// Edge as written in the configuration
#[derive(Clone, Debug, Deserialize)]
pub struct EdgeConfig {
    pub from: Endpoint,
    pub to: Endpoint,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub kind: EdgeKind,
    /// Distributors to connect to while this primary edge is down
    #[serde(default)]
    pub replacements: Vec<u64>,
    /// Detect replacement links from the topology instead
    #[serde(default)]
    pub auto_replacement: bool,
    /// User to log in with instead of the default login
    #[serde(default)]
    pub user: Option<String>,
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

/// Validated edge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyEdge {
    pub from: Endpoint,
    pub to: Endpoint,
    pub weight: u32,
    pub kind: EdgeKind,
    pub replacements: Vec<DistributorId>,
    pub auto_replacement: bool,
    pub user: Option<String>,
}

impl TopologyEdge {
    pub fn from_id(&self) -> DistributorId {
        self.from.distributor()
    }

    pub fn to_id(&self) -> DistributorId {
        self.to.distributor()
    }

    pub fn is_replacement(&self) -> bool {
        self.kind == EdgeKind::Replacement
    }

    pub fn involves(&self, id: DistributorId) -> bool {
        self.from_id() == id || self.to_id() == id
    }

    /// The endpoint that is not `id`
    pub fn other(&self, id: DistributorId) -> DistributorId {
        if self.from_id() == id {
            self.to_id()
        } else {
            self.from_id()
        }
    }
}

impl fmt::Display for TopologyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} (weight {}{})",
            self.from_id(),
            self.to_id(),
            self.weight,
            if self.is_replacement() { ", replacement" } else { "" }
        )
    }
}

/// What this distributor has to do for a remote distributor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relevance<'a> {
    /// This distributor connects
    Connects(&'a TopologyEdge),
    /// The remote distributor connects
    Listens(&'a TopologyEdge),
    /// No edge between the two
    NotRelevant,
}

/// Validated set of edges as seen from one distributor
#[derive(Clone, Debug)]
pub struct Topology {
    local: DistributorId,
    edges: Vec<TopologyEdge>,
}

impl Topology {
    pub fn from_config(local: DistributorId, edges: &[EdgeConfig]) -> DavResult<Self> {
        let edges = edges
            .iter()
            .map(|e| TopologyEdge {
                from: e.from.clone(),
                to: e.to.clone(),
                weight: e.weight,
                kind: e.kind,
                replacements: e.replacements.iter().copied().map(DistributorId::new).collect(),
                auto_replacement: e.auto_replacement,
                user: e.user.clone(),
            })
            .collect();
        Self::new(local, edges)
    }

    /// Validate edges. Self loops, duplicate edges and distributors with
    /// two different addresses are fatal.
    pub fn new(local: DistributorId, edges: Vec<TopologyEdge>) -> DavResult<Self> {
        let mut pairs = HashMap::new();
        let mut endpoints: HashMap<DistributorId, &Endpoint> = HashMap::new();

        for edge in &edges {
            if edge.from_id() == edge.to_id() {
                return Err(DavError::InvalidTopology(format!(
                    "edge from distributor {} to itself",
                    edge.from_id()
                )));
            }
            if edge.weight == 0 {
                return Err(DavError::InvalidTopology(format!("edge {} has weight 0", edge)));
            }
            let key = (edge.from_id().min(edge.to_id()), edge.from_id().max(edge.to_id()), edge.kind);
            if let Some(previous) = pairs.insert(key, edge) {
                return Err(DavError::InvalidTopology(format!(
                    "duplicate edges {} and {}",
                    previous, edge
                )));
            }
            for endpoint in [&edge.from, &edge.to] {
                match endpoints.get(&endpoint.distributor()) {
                    Some(known) if known.host != endpoint.host || known.subaddress != endpoint.subaddress => {
                        return Err(DavError::InvalidTopology(format!(
                            "distributor {} configured with addresses {} and {}",
                            endpoint.id,
                            known.address(),
                            endpoint.address()
                        )));
                    }
                    Some(_) => {}
                    None => {
                        endpoints.insert(endpoint.distributor(), endpoint);
                    }
                }
            }
        }

        for edge in edges.iter().filter(|e| e.from_id() == local && !e.replacements.is_empty()) {
            for replacement in &edge.replacements {
                let found = edges
                    .iter()
                    .any(|e| e.is_replacement() && e.from_id() == local && e.to_id() == *replacement);
                if !found {
                    tracing::warn!(
                        "edge {} names replacement distributor {} without a replacement edge",
                        edge,
                        replacement
                    );
                }
            }
        }

        Ok(Topology { local, edges })
    }

    /// Topology without edges
    pub fn empty(local: DistributorId) -> Self {
        Topology { local, edges: Vec::new() }
    }

    pub fn local(&self) -> DistributorId {
        self.local
    }

    pub fn edges(&self) -> &[TopologyEdge] {
        &self.edges
    }

    /// Where this distributor listens, if the topology says so
    pub fn local_endpoint(&self) -> Option<&Endpoint> {
        self.edges
            .iter()
            .flat_map(|e| [&e.from, &e.to])
            .find(|ep| ep.distributor() == self.local)
    }

    /// Primary edges this distributor has to establish
    pub fn outgoing_primary(&self) -> impl Iterator<Item = &TopologyEdge> {
        self.edges
            .iter()
            .filter(move |e| e.from_id() == self.local && !e.is_replacement())
    }

    /// Edge between this distributor and `remote`, primary edges first
    pub fn edge_to(&self, remote: DistributorId) -> Option<&TopologyEdge> {
        let mut candidates = self
            .edges
            .iter()
            .filter(|e| e.involves(self.local) && e.involves(remote));
        let first = candidates.next()?;
        if !first.is_replacement() {
            return Some(first);
        }
        candidates.find(|e| !e.is_replacement()).or(Some(first))
    }

    /// Outgoing edge of the given kind from this distributor to `remote`
    pub fn outgoing_edge(&self, remote: DistributorId, kind: EdgeKind) -> Option<&TopologyEdge> {
        self.edges
            .iter()
            .find(|e| e.from_id() == self.local && e.to_id() == remote && e.kind == kind)
    }

    pub fn weight_to(&self, remote: DistributorId) -> u32 {
        self.edge_to(remote).map(|e| e.weight).unwrap_or(DEFAULT_WEIGHT)
    }

    pub fn user_for(&self, remote: DistributorId) -> Option<&str> {
        self.edge_to(remote).and_then(|e| e.user.as_deref())
    }

    pub fn relevance(&self, remote: DistributorId) -> Relevance<'_> {
        match self.edge_to(remote) {
            Some(edge) if edge.from_id() == self.local => Relevance::Connects(edge),
            Some(edge) => Relevance::Listens(edge),
            None => Relevance::NotRelevant,
        }
    }

    /// Every distributor named in the topology except this one
    pub fn distributors(&self) -> BTreeSet<DistributorId> {
        self.edges
            .iter()
            .flat_map(|e| [e.from_id(), e.to_id()])
            .filter(|id| *id != self.local)
            .collect()
    }

    /// Endpoint of `id` as configured
    pub fn endpoint(&self, id: DistributorId) -> Option<&Endpoint> {
        self.edges
            .iter()
            .flat_map(|e| [&e.from, &e.to])
            .find(|ep| ep.distributor() == id)
    }

    /// Replacement edges to establish while `primary` is down
    ///
    /// With automatic detection these are the replacement edges from this
    /// distributor to the distributors the unreachable one connects to.
    pub fn replacements_for(&self, primary: &TopologyEdge) -> Vec<&TopologyEdge> {
        let targets: Vec<DistributorId> = if primary.auto_replacement {
            let unreachable = primary.to_id();
            self.edges
                .iter()
                .filter(|e| !e.is_replacement() && e.from_id() == unreachable)
                .map(|e| e.to_id())
                .collect()
        } else {
            primary.replacements.clone()
        };
        targets
            .into_iter()
            .filter(|t| *t != self.local)
            .filter_map(|t| self.outgoing_edge(t, EdgeKind::Replacement))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(id: u64) -> Endpoint {
        Endpoint {
            id,
            host: "127.0.0.1".into(),
            subaddress: 8000 + id as u16,
        }
    }

    fn edge(from: u64, to: u64, weight: u32) -> TopologyEdge {
        TopologyEdge {
            from: endpoint(from),
            to: endpoint(to),
            weight,
            kind: EdgeKind::Primary,
            replacements: Vec::new(),
            auto_replacement: false,
            user: None,
        }
    }

    fn replacement(from: u64, to: u64) -> TopologyEdge {
        TopologyEdge {
            kind: EdgeKind::Replacement,
            ..edge(from, to, 5)
        }
    }

    fn id(n: u64) -> DistributorId {
        DistributorId::new(n)
    }

    #[test]
    fn test_self_loop_rejected() {
        let result = Topology::new(id(1), vec![edge(1, 1, 1)]);
        assert!(matches!(result, Err(DavError::InvalidTopology(_))));
    }

    #[test]
    fn test_duplicate_edge_rejected() {
        let result = Topology::new(id(1), vec![edge(1, 2, 1), edge(2, 1, 3)]);
        assert!(matches!(result, Err(DavError::InvalidTopology(_))));

        // Primary and replacement edge between the same pair are fine
        assert!(Topology::new(id(1), vec![edge(1, 2, 1), replacement(1, 2)]).is_ok());
    }

    #[test]
    fn test_conflicting_subaddress_rejected() {
        let mut second = edge(1, 3, 1);
        second.from.subaddress = 9999;
        let result = Topology::new(id(1), vec![edge(1, 2, 1), second]);
        assert!(matches!(result, Err(DavError::InvalidTopology(_))));
    }

    #[test]
    fn test_zero_weight_rejected() {
        assert!(Topology::new(id(1), vec![edge(1, 2, 0)]).is_err());
    }

    #[test]
    fn test_relevance() {
        let topology = Topology::new(id(2), vec![edge(1, 2, 1), edge(2, 3, 4), edge(3, 4, 1)]).unwrap();
        assert!(matches!(topology.relevance(id(1)), Relevance::Listens(_)));
        assert!(matches!(topology.relevance(id(3)), Relevance::Connects(_)));
        assert_eq!(topology.relevance(id(4)), Relevance::NotRelevant);
        assert_eq!(topology.weight_to(id(3)), 4);
        assert_eq!(topology.weight_to(id(4)), DEFAULT_WEIGHT);
        assert_eq!(topology.outgoing_primary().count(), 1);
        assert_eq!(topology.local_endpoint().unwrap().subaddress, 8002);
        assert_eq!(
            topology.distributors().into_iter().collect::<Vec<_>>(),
            vec![id(1), id(3), id(4)]
        );
    }

    #[test]
    fn test_explicit_replacements() {
        let mut primary = edge(1, 2, 1);
        primary.replacements = vec![id(3)];
        let topology = Topology::new(id(1), vec![primary.clone(), replacement(1, 3), edge(2, 3, 1)]).unwrap();
        let found = topology.replacements_for(&primary);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].to_id(), id(3));
    }

    #[test]
    fn test_auto_replacements() {
        let mut primary = edge(1, 2, 1);
        primary.auto_replacement = true;
        let topology = Topology::new(
            id(1),
            vec![primary.clone(), edge(2, 3, 1), edge(2, 4, 1), replacement(1, 3)],
        )
        .unwrap();
        let found: Vec<_> = topology.replacements_for(&primary).iter().map(|e| e.to_id()).collect();
        assert_eq!(found, vec![id(3)]);
    }
}
