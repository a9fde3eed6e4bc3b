//! Route table shared between the protocol engine and the forwarding path.
//!
//! The engine builds a fresh [`RouteSnapshot`] after every topology or
//! metric change and swaps it in whole. Forwarding tasks clone the current
//! `Arc` and select from it; selection mutates round-robin priorities, so
//! each candidate heap sits behind its own small lock.

use crate::balance::{calc_balance, calc_shortest};
use crate::RoutingError;
use mesh_session::Route;
use mesh_topology::{AdjacencyTable, CandidateHeap, LinkStateDatabase, Weighting};
use mesh_wire::NodeAddress;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use tracing::debug;

/// Immutable-shape snapshot of all routing decisions
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    adjacency: HashMap<NodeAddress, Mutex<CandidateHeap<Route>>>,
    shortest: HashMap<NodeAddress, NodeAddress>,
    balance: HashMap<NodeAddress, Mutex<CandidateHeap<NodeAddress>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RouteSnapshot {
    /// Compute every route table from the engine state at time `now`
    pub fn build(adjacencies: &AdjacencyTable<Route>, db: &LinkStateDatabase, now: u64) -> Self {
        let adjacency = adjacencies
            .iter()
            .filter_map(|(node, _)| {
                adjacencies
                    .get_routes(node, now)
                    .map(|heap| (*node, Mutex::new(heap)))
            })
            .collect();
        let shortest = calc_shortest(db);
        let balance = calc_balance(adjacencies, db)
            .into_iter()
            .map(|(dst, heap)| (dst, Mutex::new(heap)))
            .collect();
        Self {
            adjacency,
            shortest,
            balance,
        }
    }

    /// Next direct route to an adjacent node
    pub fn adjacent(&self, node: NodeAddress) -> Result<Route, RoutingError> {
        let heap = self.adjacency.get(&node).ok_or(RoutingError::NoRoute(node))?;
        let selected = lock(heap).select(Weighting::Linear);
        selected
            .map(|(route, _)| route)
            .ok_or(RoutingError::NoRoute(node))
    }

    /// Route towards the shortest-path next hop for `dst`
    pub fn shortest(&self, dst: NodeAddress) -> Result<Route, RoutingError> {
        let next = self.shortest.get(&dst).ok_or(RoutingError::NoRoute(dst))?;
        self.adjacent(*next)
    }

    /// Load-balanced route for `dst` and the through-hint to pin on the frame
    pub fn balanced(&self, dst: NodeAddress) -> Result<(Route, NodeAddress), RoutingError> {
        let heap = self.balance.get(&dst).ok_or(RoutingError::NoRoute(dst))?;
        let selected = lock(heap).select(Weighting::Squared);
        let (next, through) = selected.ok_or(RoutingError::NoRoute(dst))?;
        Ok((self.adjacent(next)?, through))
    }

    /// JSON view for debug dumps
    pub fn describe(&self) -> Value {
        let adjacency: BTreeMap<String, Vec<String>> = self
            .adjacency
            .iter()
            .map(|(node, heap)| {
                let routes = lock(heap)
                    .candidates()
                    .iter()
                    .map(|c| format!("{} {}", c.target, c.metric))
                    .collect();
                (node.to_string(), routes)
            })
            .collect();
        let shortest: BTreeMap<String, String> = self
            .shortest
            .iter()
            .map(|(dst, next)| (dst.to_string(), next.to_string()))
            .collect();
        let balance: BTreeMap<String, Vec<String>> = self
            .balance
            .iter()
            .map(|(dst, heap)| {
                let routes = lock(heap)
                    .candidates()
                    .iter()
                    .map(|c| format!("next {} through {} {}", c.target, c.through, c.metric))
                    .collect();
                (dst.to_string(), routes)
            })
            .collect();
        json!({
            "adjacency": adjacency,
            "shortest": shortest,
            "balance": balance,
        })
    }
}

/// Shared handle to the current route snapshot
#[derive(Debug, Default)]
pub struct RouteTable {
    current: RwLock<Arc<RouteSnapshot>>,
}

impl RouteTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current snapshot
    pub fn install(&self, snapshot: RouteSnapshot) {
        debug!(
            "Installing route table: {} adjacent, {} shortest, {} balanced",
            snapshot.adjacency.len(),
            snapshot.shortest.len(),
            snapshot.balance.len()
        );
        let mut current = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *current = Arc::new(snapshot);
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// See [`RouteSnapshot::adjacent`]
    pub fn adjacent(&self, node: NodeAddress) -> Result<Route, RoutingError> {
        self.snapshot().adjacent(node)
    }

    /// See [`RouteSnapshot::shortest`]
    pub fn shortest(&self, dst: NodeAddress) -> Result<Route, RoutingError> {
        self.snapshot().shortest(dst)
    }

    /// See [`RouteSnapshot::balanced`]
    pub fn balanced(&self, dst: NodeAddress) -> Result<(Route, NodeAddress), RoutingError> {
        self.snapshot().balanced(dst)
    }
}
