//! Directly reachable neighbors and their per-route metrics.
//!
//! The table is generic over the route handle so it can be exercised
//! without real links.

use crate::candidate::{CandidateHeap, RouteCandidate};
use crate::metric::{MetricEstimator, RttSample, MAX_METRIC, UPDATE_THRESHOLD};
use mesh_wire::NodeAddress;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::hash::Hash;
use tracing::{debug, info};

/// Outcome of feeding one RTT sample into an adjacency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdjacencyUpdate {
    /// The sample came in on a route not seen before
    pub is_new_route: bool,
    /// The cached metric moved past the flood threshold
    pub should_reflood: bool,
}

/// One directly reachable neighbor
#[derive(Debug, Clone)]
pub struct Adjacency<R> {
    /// Neighbor process start time, as last reported
    pub boot_time: u64,
    metric: u64,
    routes: HashMap<R, MetricEstimator>,
}

impl<R: Clone + Eq + Hash> Adjacency<R> {
    /// Create an adjacency with no routes and an unusable metric
    pub fn new(boot_time: u64) -> Self {
        Self {
            boot_time,
            metric: MAX_METRIC,
            routes: HashMap::new(),
        }
    }

    /// Cached aggregate metric, the one advertised in link-state updates
    pub fn metric(&self) -> u64 {
        self.metric
    }

    /// Routes and their estimators
    pub fn routes(&self) -> impl Iterator<Item = (&R, &MetricEstimator)> {
        self.routes.iter()
    }

    /// Whether no live route remains
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Record an RTT sample taken on `route`
    pub fn update(&mut self, route: R, rtt: u64, now: u64) -> AdjacencyUpdate {
        let is_new_route = !self.routes.contains_key(&route);
        self.routes.entry(route).or_default().push(RttSample {
            latency: rtt,
            observed_at: now,
        });
        AdjacencyUpdate {
            is_new_route,
            should_reflood: self.refresh(now),
        }
    }

    /// Drop dead routes and recompute the cached metric
    pub fn sweep(&mut self, now: u64) -> bool {
        self.refresh(now)
    }

    /// Forget every route matching `dead`
    pub fn remove_routes<F: FnMut(&R) -> bool>(&mut self, mut dead: F) -> bool {
        let before = self.routes.len();
        self.routes.retain(|route, _| !dead(route));
        self.routes.len() != before
    }

    /// Live routes to this neighbor as a pruned candidate heap
    pub fn candidates(&self, through: NodeAddress, now: u64) -> Option<CandidateHeap<R>> {
        let candidates = self
            .routes
            .iter()
            .map(|(route, estimator)| (route, estimator.value(now)))
            .filter(|(_, metric)| *metric < MAX_METRIC)
            .map(|(route, metric)| RouteCandidate::new(route.clone(), through, metric))
            .collect();
        CandidateHeap::new(candidates)
    }

    fn refresh(&mut self, now: u64) -> bool {
        self.routes.retain(|_, estimator| estimator.value(now) != MAX_METRIC);
        let min = self
            .routes
            .values()
            .map(|estimator| estimator.value(now))
            .min()
            .unwrap_or(MAX_METRIC);
        if exceeds_threshold(self.metric, min) {
            self.metric = min;
            true
        } else {
            false
        }
    }
}

fn exceeds_threshold(old: u64, new: u64) -> bool {
    if old == 0 {
        return new != 0;
    }
    (old.abs_diff(new) as u128) * 100 / old as u128 > UPDATE_THRESHOLD as u128
}

/// All adjacencies of this node
#[derive(Debug, Clone)]
pub struct AdjacencyTable<R> {
    adjacencies: BTreeMap<NodeAddress, Adjacency<R>>,
}

impl<R> Default for AdjacencyTable<R> {
    fn default() -> Self {
        Self {
            adjacencies: BTreeMap::new(),
        }
    }
}

impl<R: Clone + Eq + Hash> AdjacencyTable<R> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an RTT sample from `node` on `route`, creating the adjacency if needed
    pub fn update(&mut self, node: NodeAddress, boot_time: u64, route: R, rtt: u64, now: u64) -> AdjacencyUpdate {
        let adjacency = self.adjacencies.entry(node).or_insert_with(|| {
            info!("New adjacency {}", node);
            Adjacency::new(boot_time)
        });
        if adjacency.boot_time != boot_time {
            debug!("Adjacency {} restarted", node);
            adjacency.boot_time = boot_time;
        }
        adjacency.update(route, rtt, now)
    }

    /// Sweep every adjacency and delete the ones left without routes.
    ///
    /// Returns whether a flood is needed.
    pub fn sweep(&mut self, now: u64) -> bool {
        let mut should_reflood = false;
        for adjacency in self.adjacencies.values_mut() {
            should_reflood |= adjacency.sweep(now);
        }
        self.adjacencies.retain(|node, adjacency| {
            if adjacency.is_empty() {
                info!("Adjacency {} lost", node);
                should_reflood = true;
                false
            } else {
                true
            }
        });
        should_reflood
    }

    /// Remove the routes matching `dead` from every adjacency
    pub fn remove_routes<F: FnMut(&R) -> bool>(&mut self, mut dead: F) -> bool {
        let mut removed = false;
        for adjacency in self.adjacencies.values_mut() {
            removed |= adjacency.remove_routes(&mut dead);
        }
        removed
    }

    /// Cached metrics of usable adjacencies
    pub fn metrics(&self) -> BTreeMap<NodeAddress, u64> {
        self.adjacencies
            .iter()
            .filter(|(_, a)| a.metric < MAX_METRIC)
            .map(|(node, a)| (*node, a.metric))
            .collect()
    }

    /// Look up one adjacency
    pub fn get(&self, node: &NodeAddress) -> Option<&Adjacency<R>> {
        self.adjacencies.get(node)
    }

    /// All adjacencies in address order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeAddress, &Adjacency<R>)> {
        self.adjacencies.iter()
    }

    /// Pruned candidate heap of the direct routes to `node`
    pub fn get_routes(&self, node: &NodeAddress, now: u64) -> Option<CandidateHeap<R>> {
        self.adjacencies.get(node)?.candidates(*node, now)
    }

    /// Number of adjacencies
    pub fn len(&self) -> usize {
        self.adjacencies.len()
    }

    /// Whether there is no adjacency
    pub fn is_empty(&self) -> bool {
        self.adjacencies.is_empty()
    }
}

impl<R: Clone + Eq + Hash + Display> AdjacencyTable<R> {
    /// JSON view for debug dumps
    pub fn describe(&self, now: u64) -> Value {
        let mut out = serde_json::Map::new();
        for (node, adjacency) in &self.adjacencies {
            let routes: BTreeMap<String, String> = adjacency
                .routes
                .iter()
                .map(|(route, estimator)| (route.to_string(), estimator.describe(now)))
                .collect();
            out.insert(
                node.to_string(),
                json!({
                    "boot_time": adjacency.boot_time,
                    "metric": adjacency.metric,
                    "routes": routes,
                }),
            );
        }
        Value::Object(out)
    }
}
