//! Best-way routing simulator
//!
//! Runs one [`BestWayRouter`] per distributor and connects them with
//! in-memory links. Each link is a FIFO queue like a TCP connection, but
//! the simulator picks which link delivers next from a seeded RNG, so
//! updates on different links interleave in arbitrary order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use dav_core::{ConnectionId, DavError, DavResult, DistributorId};
use dav_runtime::{BestWayRouter, TransmitterLink};
use dav_wire::Telegram;

use crate::oracle::{shortest_paths, ShortestPaths};

/// One direction of a simulated connection
pub struct SimLink {
    connection: ConnectionId,
    from: DistributorId,
    to: DistributorId,
    weight: u32,
    queue: Mutex<VecDeque<Telegram>>,
    closed: Mutex<bool>,
}

impl SimLink {
    fn new(from: DistributorId, to: DistributorId, weight: u32) -> Arc<Self> {
        Arc::new(SimLink {
            connection: ConnectionId::next(),
            from,
            to,
            weight,
            queue: Mutex::new(VecDeque::new()),
            closed: Mutex::new(false),
        })
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    fn close(&self) {
        *self.closed.lock() = true;
        self.queue.lock().clear();
    }
}

impl TransmitterLink for SimLink {
    fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    fn remote_id(&self) -> DistributorId {
        self.to
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn send_telegram(&self, telegram: Telegram) -> DavResult<()> {
        if *self.closed.lock() {
            return Err(DavError::ConnectionClosed);
        }
        self.queue.lock().push_back(telegram);
        Ok(())
    }
}

/// In-memory mesh of routers
pub struct RoutingMeshSimulator {
    routers: BTreeMap<DistributorId, Arc<BestWayRouter>>,
    /// Keyed by (sender, receiver)
    links: BTreeMap<(DistributorId, DistributorId), Arc<SimLink>>,
    rng: StdRng,
    delivered: u64,
}

impl RoutingMeshSimulator {
    pub fn new(seed: u64) -> Self {
        RoutingMeshSimulator {
            routers: BTreeMap::new(),
            links: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            delivered: 0,
        }
    }

    /// Add a distributor without links. Adding it twice keeps the first.
    pub fn add_node(&mut self, id: DistributorId) -> Arc<BestWayRouter> {
        self.routers
            .entry(id)
            .or_insert_with(|| Arc::new(BestWayRouter::new(id)))
            .clone()
    }

    pub fn router(&self, id: DistributorId) -> Option<&Arc<BestWayRouter>> {
        self.routers.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = DistributorId> + '_ {
        self.routers.keys().copied()
    }

    /// Bring up a link between `a` and `b`. An existing link between the
    /// two is replaced.
    pub fn connect(&mut self, a: DistributorId, b: DistributorId, weight: u32) {
        self.disconnect(a, b);
        let router_a = self.add_node(a);
        let router_b = self.add_node(b);
        let ab = SimLink::new(a, b, weight);
        let ba = SimLink::new(b, a, weight);
        self.links.insert((a, b), ab.clone());
        self.links.insert((b, a), ba.clone());
        router_a.add_link(ab);
        router_b.add_link(ba);
    }

    /// Tear down the link between `a` and `b`. Queued telegrams are lost.
    pub fn disconnect(&mut self, a: DistributorId, b: DistributorId) -> bool {
        let ab = self.links.remove(&(a, b));
        let ba = self.links.remove(&(b, a));
        let mut found = false;
        for (link, local) in [(ab, a), (ba, b)] {
            if let Some(link) = link {
                link.close();
                if let Some(router) = self.routers.get(&local) {
                    router.handle_disconnection(link.to, link.connection);
                }
                found = true;
            }
        }
        found
    }

    /// Live links as undirected edges
    pub fn edges(&self) -> Vec<(DistributorId, DistributorId, u32)> {
        self.links
            .values()
            .filter(|l| l.from < l.to)
            .map(|l| (l.from, l.to, l.weight))
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.links.values().map(|l| l.pending()).sum()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Deliver one telegram from a randomly picked non-empty link
    pub fn step(&mut self) -> bool {
        let busy: Vec<Arc<SimLink>> = self.links.values().filter(|l| l.pending() > 0).cloned().collect();
        if busy.is_empty() {
            return false;
        }
        let link = &busy[self.rng.gen_range(0..busy.len())];
        let Some(telegram) = link.queue.lock().pop_front() else {
            return true;
        };
        self.delivered += 1;

        // The receiver knows the sender through its own end of the link
        let Some(reverse) = self.links.get(&(link.to, link.from)) else {
            return true;
        };
        let Some(router) = self.routers.get(&link.to) else {
            return true;
        };
        match telegram {
            Telegram::BestWayUpdate { updates } => {
                router.handle_routing_update(link.from, reverse.connection, &updates);
            }
            other => tracing::trace!("simulator ignores {:?}", other.kind()),
        }
        true
    }

    /// Deliver until every queue is empty. Fails after `max_steps`
    /// deliveries.
    pub fn run_until_quiet(&mut self, max_steps: usize) -> DavResult<usize> {
        for steps in 0..=max_steps {
            if !self.step() {
                return Ok(steps);
            }
        }
        Err(DavError::Timeout(format!(
            "routing still busy after {} deliveries, {} in flight",
            max_steps,
            self.in_flight()
        )))
    }

    /// Reference costs for the current links
    pub fn oracle(&self) -> ShortestPaths {
        shortest_paths(self.nodes(), &self.edges())
    }

    /// Compare every routing table with the oracle. Returns a description
    /// of the first mismatch.
    pub fn check_routes(&self) -> Result<(), String> {
        let oracle = self.oracle();
        for (&local, router) in &self.routers {
            for &dest in self.routers.keys() {
                if dest == local {
                    if router.best_way(dest).is_some() {
                        return Err(format!("{} has a route to itself", local));
                    }
                    continue;
                }
                let expected = oracle.cost(local, dest);
                let actual = router.cost(dest).map(u64::from);
                if expected != actual {
                    return Err(format!(
                        "{} -> {}: cost {:?}, expected {:?}",
                        local, dest, actual, expected
                    ));
                }
                if let Some(hop) = router.best_way(dest) {
                    let Some(link) = self.links.get(&(local, hop)) else {
                        return Err(format!("{} -> {}: next hop {} is not a neighbour", local, dest, hop));
                    };
                    if !oracle.on_shortest_path(local, hop, link.weight, dest) {
                        return Err(format!("{} -> {}: next hop {} is not on a cheapest path", local, dest, hop));
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for RoutingMeshSimulator {
    fn default() -> Self {
        Self::new(0)
    }
}
