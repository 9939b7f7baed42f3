//! Best-way routing between distributors
//!
//! Every distributor advertises to its neighbours, per destination, the cost
//! of its best path and the distributors that path runs through. A
//! neighbour's route is usable when the advertised path does not contain
//! the receiving distributor; the cost through neighbour N is the weight of
//! the link to N plus N's advertised cost. The cheapest candidate wins, a
//! tie keeps the current next hop.
//!
//! Updates are only sent when a route changes. A lost route is advertised
//! as unreachable.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use dav_core::{ConnectionId, DistributorId};
use dav_wire::{RoutingUpdate, Telegram};

use crate::TransmitterLink;

/// Told about next hop changes
pub trait RouteChangeListener: Send + Sync {
    /// The best link toward `destination` changed. `None` means unreachable.
    fn route_changed(
        &self,
        destination: DistributorId,
        old: Option<&Arc<dyn TransmitterLink>>,
        new: Option<&Arc<dyn TransmitterLink>>,
    );
}

/// Query side of the router
pub trait RouteLookup: Send + Sync {
    /// Link to the next hop toward `destination`
    fn best_link(&self, destination: DistributorId) -> Option<Arc<dyn TransmitterLink>>;

    /// Every distributor with a route
    fn reachable(&self) -> Vec<DistributorId>;
}

/// One row of the routing table
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoutingEntry {
    pub destination: DistributorId,
    pub next_hop: DistributorId,
    pub connection: ConnectionId,
    pub cost: u32,
    /// Distributors from the next hop up to and including the destination
    pub path: Vec<DistributorId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Advertised {
    cost: u32,
    path: Vec<DistributorId>,
}

struct Neighbour {
    link: Arc<dyn TransmitterLink>,
    advertised: HashMap<DistributorId, Advertised>,
}

#[derive(Clone)]
struct Route {
    link: Arc<dyn TransmitterLink>,
    cost: u32,
    path: Vec<DistributorId>,
}

impl Route {
    fn next_hop(&self) -> DistributorId {
        self.link.remote_id()
    }

    fn same_as(&self, other: &Route) -> bool {
        self.link.connection_id() == other.link.connection_id()
            && self.cost == other.cost
            && self.path == other.path
    }
}

#[derive(Default)]
struct RouterState {
    neighbours: HashMap<DistributorId, Neighbour>,
    routes: HashMap<DistributorId, Route>,
}

struct RouteChange {
    destination: DistributorId,
    old: Option<Arc<dyn TransmitterLink>>,
    new: Option<Arc<dyn TransmitterLink>>,
}

/// Routing updates computed under the state lock, sent after it was
/// released. The send lock keeps them in the order they were computed.
struct Outbox<'a> {
    _order: MutexGuard<'a, ()>,
    sends: Vec<(Arc<dyn TransmitterLink>, Vec<RoutingUpdate>)>,
}

impl Outbox<'_> {
    fn flush(self) {
        for (link, updates) in self.sends {
            if let Err(e) = link.send_telegram(Telegram::BestWayUpdate { updates }) {
                tracing::debug!(remote = %link.remote_id(), "routing update not sent: {}", e);
            }
        }
    }
}

/// Routing table of one distributor
pub struct BestWayRouter {
    local: DistributorId,
    state: Mutex<RouterState>,
    sending: Mutex<()>,
    listeners: Mutex<Vec<Weak<dyn RouteChangeListener>>>,
}

impl BestWayRouter {
    pub fn new(local: DistributorId) -> Self {
        BestWayRouter {
            local,
            state: Mutex::new(RouterState::default()),
            sending: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn local_id(&self) -> DistributorId {
        self.local
    }

    pub fn add_listener(&self, listener: Weak<dyn RouteChangeListener>) {
        self.listeners.lock().push(listener);
    }

    /// A link to a neighbour finished its initialisation
    pub fn add_link(&self, link: Arc<dyn TransmitterLink>) {
        let remote = link.remote_id();
        if remote == self.local {
            tracing::warn!("ignoring link {} to this distributor itself", link.connection_id());
            return;
        }
        let (changes, outbox) = {
            let mut state = self.state.lock();
            if let Some(previous) = state.neighbours.get(&remote) {
                tracing::debug!(
                    remote = %remote,
                    "link {} replaces {}",
                    link.connection_id(),
                    previous.link.connection_id()
                );
            }
            state.neighbours.insert(
                remote,
                Neighbour {
                    link: link.clone(),
                    advertised: HashMap::new(),
                },
            );
            let (updates, changes) = self.recompute(&mut state);
            let mut sends = Self::broadcast(&state, &updates, Some(link.connection_id()));

            let full: Vec<RoutingUpdate> = state
                .routes
                .iter()
                .map(|(dest, route)| RoutingUpdate {
                    destination: *dest,
                    resistance: Some(route.cost),
                    involved: route.path.clone(),
                })
                .collect();
            if !full.is_empty() {
                sends.push((link.clone(), full));
            }
            (changes, self.outbox(sends))
        };
        outbox.flush();
        self.notify(changes);
    }

    /// A link went away. Ignored if `connection` is not the current link.
    pub fn handle_disconnection(&self, remote: DistributorId, connection: ConnectionId) {
        let (changes, outbox) = {
            let mut state = self.state.lock();
            match state.neighbours.get(&remote) {
                Some(n) if n.link.connection_id() == connection => {}
                _ => return,
            }
            state.neighbours.remove(&remote);
            let (updates, changes) = self.recompute(&mut state);
            let sends = Self::broadcast(&state, &updates, None);
            (changes, self.outbox(sends))
        };
        outbox.flush();
        self.notify(changes);
    }

    /// Advertisement from a neighbour
    pub fn handle_routing_update(
        &self,
        remote: DistributorId,
        connection: ConnectionId,
        updates: &[RoutingUpdate],
    ) {
        let (changes, outbox) = {
            let mut state = self.state.lock();
            let local = self.local;
            let Some(neighbour) = state.neighbours.get_mut(&remote) else {
                tracing::debug!(remote = %remote, "routing update from unknown neighbour ignored");
                return;
            };
            if neighbour.link.connection_id() != connection {
                tracing::debug!(remote = %remote, "routing update from stale link {} ignored", connection);
                return;
            }
            for update in updates {
                let usable = update.destination != local
                    && update.destination != remote
                    && !update.involved.contains(&local)
                    && !update.involved.contains(&remote);
                match update.resistance {
                    Some(cost) if usable => {
                        neighbour.advertised.insert(
                            update.destination,
                            Advertised {
                                cost,
                                path: update.involved.clone(),
                            },
                        );
                    }
                    _ => {
                        neighbour.advertised.remove(&update.destination);
                    }
                }
            }
            let (updates, changes) = self.recompute(&mut state);
            let sends = Self::broadcast(&state, &updates, None);
            (changes, self.outbox(sends))
        };
        outbox.flush();
        self.notify(changes);
    }

    /// Next hop toward `destination`
    pub fn best_way(&self, destination: DistributorId) -> Option<DistributorId> {
        self.state.lock().routes.get(&destination).map(|r| r.next_hop())
    }

    pub fn cost(&self, destination: DistributorId) -> Option<u32> {
        self.state.lock().routes.get(&destination).map(|r| r.cost)
    }

    /// Snapshot, sorted by destination
    pub fn routing_table(&self) -> Vec<RoutingEntry> {
        let state = self.state.lock();
        let mut table: Vec<RoutingEntry> = state
            .routes
            .iter()
            .map(|(dest, route)| RoutingEntry {
                destination: *dest,
                next_hop: route.next_hop(),
                connection: route.link.connection_id(),
                cost: route.cost,
                path: route.path.clone(),
            })
            .collect();
        table.sort_by_key(|e| e.destination);
        table
    }

    pub fn neighbours(&self) -> Vec<DistributorId> {
        let mut ids: Vec<_> = self.state.lock().neighbours.keys().copied().collect();
        ids.sort();
        ids
    }

    fn recompute(&self, state: &mut RouterState) -> (Vec<RoutingUpdate>, Vec<RouteChange>) {
        let mut best: HashMap<DistributorId, Route> = HashMap::new();

        for (id, neighbour) in &state.neighbours {
            let weight = neighbour.link.weight();
            let mut candidates = vec![(*id, weight, vec![*id])];
            for (dest, adv) in &neighbour.advertised {
                let mut path = Vec::with_capacity(adv.path.len() + 1);
                path.push(*id);
                path.extend_from_slice(&adv.path);
                candidates.push((*dest, weight.saturating_add(adv.cost), path));
            }

            for (dest, cost, path) in candidates {
                let current_hop = state.routes.get(&dest).map(|r| r.next_hop());
                let rank = |hop: DistributorId, cost: u32, len: usize| (cost, Some(hop) != current_hop, hop, len);
                let better = match best.get(&dest) {
                    None => true,
                    Some(existing) => {
                        rank(*id, cost, path.len())
                            < rank(existing.next_hop(), existing.cost, existing.path.len())
                    }
                };
                if better {
                    best.insert(
                        dest,
                        Route {
                            link: neighbour.link.clone(),
                            cost,
                            path,
                        },
                    );
                }
            }
        }

        let destinations: BTreeSet<DistributorId> =
            state.routes.keys().chain(best.keys()).copied().collect();
        let mut updates = Vec::new();
        let mut changes = Vec::new();
        for dest in destinations {
            let old = state.routes.get(&dest);
            let new = best.get(&dest);
            match (old, new) {
                (Some(o), Some(n)) if o.same_as(n) => continue,
                _ => {}
            }
            updates.push(match new {
                Some(route) => RoutingUpdate {
                    destination: dest,
                    resistance: Some(route.cost),
                    involved: route.path.clone(),
                },
                None => RoutingUpdate {
                    destination: dest,
                    resistance: None,
                    involved: Vec::new(),
                },
            });
            let old_conn = old.map(|r| r.link.connection_id());
            let new_conn = new.map(|r| r.link.connection_id());
            if old_conn != new_conn {
                tracing::debug!(
                    destination = %dest,
                    "best way changed from {:?} to {:?}",
                    old.map(|r| r.next_hop()),
                    new.map(|r| r.next_hop())
                );
                changes.push(RouteChange {
                    destination: dest,
                    old: old.map(|r| r.link.clone()),
                    new: new.map(|r| r.link.clone()),
                });
            }
        }
        state.routes = best;
        (updates, changes)
    }

    fn broadcast(
        state: &RouterState,
        updates: &[RoutingUpdate],
        skip: Option<ConnectionId>,
    ) -> Vec<(Arc<dyn TransmitterLink>, Vec<RoutingUpdate>)> {
        if updates.is_empty() {
            return Vec::new();
        }
        state
            .neighbours
            .values()
            .filter(|n| Some(n.link.connection_id()) != skip)
            .map(|n| (n.link.clone(), updates.to_vec()))
            .collect()
    }

    /// Take the send lock; called with the state lock held
    fn outbox(&self, sends: Vec<(Arc<dyn TransmitterLink>, Vec<RoutingUpdate>)>) -> Outbox<'_> {
        Outbox {
            _order: self.sending.lock(),
            sends,
        }
    }

    fn notify(&self, changes: Vec<RouteChange>) {
        if changes.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn RouteChangeListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for change in &changes {
            for listener in &listeners {
                listener.route_changed(change.destination, change.old.as_ref(), change.new.as_ref());
            }
        }
    }
}

impl RouteLookup for BestWayRouter {
    fn best_link(&self, destination: DistributorId) -> Option<Arc<dyn TransmitterLink>> {
        self.state.lock().routes.get(&destination).map(|r| r.link.clone())
    }

    fn reachable(&self) -> Vec<DistributorId> {
        let mut ids: Vec<_> = self.state.lock().routes.keys().copied().collect();
        ids.sort();
        ids
    }
}
