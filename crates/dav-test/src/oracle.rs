//! Shortest path reference for routing checks

use std::collections::BTreeMap;

use dav_core::DistributorId;

/// All-pairs shortest path costs of an undirected weighted graph
#[derive(Debug, Clone)]
pub struct ShortestPaths {
    index: BTreeMap<DistributorId, usize>,
    dist: Vec<Vec<Option<u64>>>,
}

impl ShortestPaths {
    /// Cost from `from` to `to`. `Some(0)` for a node to itself, `None` if
    /// unreachable or unknown.
    pub fn cost(&self, from: DistributorId, to: DistributorId) -> Option<u64> {
        let (&i, &j) = (self.index.get(&from)?, self.index.get(&to)?);
        self.dist[i][j]
    }

    pub fn nodes(&self) -> impl Iterator<Item = DistributorId> + '_ {
        self.index.keys().copied()
    }

    /// Whether `hop` lies on some cheapest path from `from` to `to`, given
    /// the weight of the direct link `from`-`hop`
    pub fn on_shortest_path(&self, from: DistributorId, hop: DistributorId, link_weight: u32, to: DistributorId) -> bool {
        match (self.cost(from, to), self.cost(hop, to)) {
            (Some(total), Some(rest)) => u64::from(link_weight) + rest == total,
            _ => false,
        }
    }
}

/// Floyd-Warshall over `edges`. Parallel edges keep the lighter weight.
pub fn shortest_paths(
    nodes: impl IntoIterator<Item = DistributorId>,
    edges: &[(DistributorId, DistributorId, u32)],
) -> ShortestPaths {
    let mut index = BTreeMap::new();
    for node in nodes.into_iter().chain(edges.iter().flat_map(|&(a, b, _)| [a, b])) {
        let next = index.len();
        index.entry(node).or_insert(next);
    }

    let n = index.len();
    let mut dist = vec![vec![None; n]; n];
    for (i, row) in dist.iter_mut().enumerate() {
        row[i] = Some(0);
    }
    for &(a, b, weight) in edges {
        let (i, j) = (index[&a], index[&b]);
        if i == j {
            continue;
        }
        let weight = u64::from(weight);
        for (x, y) in [(i, j), (j, i)] {
            if dist[x][y].map_or(true, |d| weight < d) {
                dist[x][y] = Some(weight);
            }
        }
    }

    for k in 0..n {
        for i in 0..n {
            let Some(ik) = dist[i][k] else { continue };
            for j in 0..n {
                if let Some(kj) = dist[k][j] {
                    let through = ik + kj;
                    if dist[i][j].map_or(true, |d| through < d) {
                        dist[i][j] = Some(through);
                    }
                }
            }
        }
    }

    ShortestPaths { index, dist }
}
