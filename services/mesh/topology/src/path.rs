//! Shortest path computation over advertised link metrics.
//!
//! The graph is directed: the weight of `u -> v` is the metric `u`
//! advertised for `v`. Only nodes that own a link-state entry are part of
//! the graph.

use mesh_wire::NodeAddress;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};

/// Directed weighted graph of link-state owners
pub trait LinkGraph {
    /// Whether `node` owns a link-state entry
    fn contains_node(&self, node: &NodeAddress) -> bool;

    /// Outgoing edges of `node` with their metrics
    fn edges(&self, node: &NodeAddress) -> Vec<(NodeAddress, u64)>;
}

impl LinkGraph for BTreeMap<NodeAddress, BTreeMap<NodeAddress, u64>> {
    fn contains_node(&self, node: &NodeAddress) -> bool {
        self.contains_key(node)
    }

    fn edges(&self, node: &NodeAddress) -> Vec<(NodeAddress, u64)> {
        self.get(node)
            .map(|edges| edges.iter().map(|(n, m)| (*n, *m)).collect())
            .unwrap_or_default()
    }
}

/// A computed path, source first
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Path {
    /// Nodes from the source to the destination inclusive
    pub nodes: Vec<NodeAddress>,
    /// Sum of edge metrics
    pub distance: u64,
}

impl Path {
    /// First hop after the source, or the source itself for the trivial path
    pub fn next_hop(&self) -> Option<NodeAddress> {
        self.nodes.get(1).or_else(|| self.nodes.first()).copied()
    }

    /// Node before the destination, or the source for the trivial path
    pub fn penultimate(&self) -> Option<NodeAddress> {
        let len = self.nodes.len();
        if len >= 2 {
            Some(self.nodes[len - 2])
        } else {
            self.nodes.first().copied()
        }
    }
}

/// Dijkstra from `from` to every reachable owner.
///
/// Edges into `exclude` are ignored so paths computed on behalf of a
/// neighbor never loop back through it. The result always contains `from`
/// at distance zero.
pub fn shortest_paths<G: LinkGraph + ?Sized>(
    graph: &G,
    from: NodeAddress,
    exclude: Option<NodeAddress>,
) -> HashMap<NodeAddress, Path> {
    let mut distances: HashMap<NodeAddress, u64> = HashMap::new();
    let mut previous: HashMap<NodeAddress, NodeAddress> = HashMap::new();
    let mut unvisited: BinaryHeap<Reverse<(u64, NodeAddress)>> = BinaryHeap::new();

    distances.insert(from, 0);
    unvisited.push(Reverse((0, from)));

    while let Some(Reverse((current_dist, current_node))) = unvisited.pop() {
        // Skip if we've already found a better path
        if current_dist > distances.get(&current_node).copied().unwrap_or(u64::MAX) {
            continue;
        }

        for (neighbor, metric) in graph.edges(&current_node) {
            if Some(neighbor) == exclude || !graph.contains_node(&neighbor) {
                continue;
            }
            let new_dist = current_dist.saturating_add(metric);
            let existing_dist = distances.get(&neighbor).copied().unwrap_or(u64::MAX);
            if new_dist < existing_dist {
                distances.insert(neighbor, new_dist);
                previous.insert(neighbor, current_node);
                unvisited.push(Reverse((new_dist, neighbor)));
            }
        }
    }

    distances
        .into_iter()
        .map(|(dst, distance)| {
            let mut nodes = vec![dst];
            let mut cursor = dst;
            while let Some(&prev) = previous.get(&cursor) {
                nodes.push(prev);
                cursor = prev;
            }
            nodes.reverse();
            (dst, Path { nodes, distance })
        })
        .collect()
}
