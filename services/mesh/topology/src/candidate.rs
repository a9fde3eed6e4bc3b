//! Weighted round-robin route candidates.
//!
//! Each destination keeps a small heap of candidates ordered by a running
//! `current` priority. Selecting a candidate returns the one with the lowest
//! priority and then charges it its own metric (or squared metric), so
//! cheaper candidates are picked proportionally more often while every
//! candidate within tolerance still gets traffic.

use mesh_wire::NodeAddress;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Candidates with a metric above `min * PRUNE_RATIO / PRUNE_SCALE` are dropped
pub const PRUNE_RATIO: u64 = 1425;
/// Fixed-point scale of [`PRUNE_RATIO`]
pub const PRUNE_SCALE: u64 = 1024;

/// How a selected candidate is charged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Weighting {
    /// Charge the metric itself
    Linear,
    /// Charge the squared metric
    Squared,
}

impl Weighting {
    fn charge(&self, metric: u64) -> u128 {
        match self {
            Weighting::Linear => metric as u128,
            Weighting::Squared => (metric as u128) * (metric as u128),
        }
    }
}

/// One way of reaching a destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteCandidate<T> {
    /// Physical route or next-hop node
    pub target: T,
    /// Node before the destination on this path
    pub through: NodeAddress,
    /// Total path metric
    pub metric: u64,
    current: u128,
}

impl<T> RouteCandidate<T> {
    /// Create a candidate whose priority starts at its metric
    pub fn new(target: T, through: NodeAddress, metric: u64) -> Self {
        Self {
            target,
            through,
            metric,
            current: metric as u128,
        }
    }

    /// Running selection priority
    pub fn current(&self) -> u128 {
        self.current
    }
}

/// Sort by metric and drop candidates worse than the tolerance of the best
pub fn prune<T>(candidates: &mut Vec<RouteCandidate<T>>) {
    candidates.sort_by_key(|c| c.metric);
    let Some(best) = candidates.first() else {
        return;
    };
    let threshold = best.metric as u128 * PRUNE_RATIO as u128 / PRUNE_SCALE as u128;
    if let Some(cut) = candidates
        .iter()
        .position(|c| c.metric as u128 > threshold)
    {
        candidates.truncate(cut);
    }
}

/// Min-priority heap of candidates for one destination
#[derive(Debug, Clone)]
pub struct CandidateHeap<T> {
    candidates: Vec<RouteCandidate<T>>,
    order: BinaryHeap<Reverse<(u128, usize)>>,
}

impl<T: Clone> CandidateHeap<T> {
    /// Prune and heapify; `None` when there is no candidate
    pub fn new(mut candidates: Vec<RouteCandidate<T>>) -> Option<Self> {
        prune(&mut candidates);
        if candidates.is_empty() {
            return None;
        }
        let order = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| Reverse((c.current, i)))
            .collect();
        Some(Self { candidates, order })
    }

    /// Take the candidate with the lowest priority and charge it.
    ///
    /// Returns the candidate's target and through-hint.
    pub fn select(&mut self, weighting: Weighting) -> Option<(T, NodeAddress)> {
        let Reverse((_, index)) = self.order.pop()?;
        let candidate = &mut self.candidates[index];
        candidate.current = candidate
            .current
            .saturating_add(weighting.charge(candidate.metric));
        self.order.push(Reverse((candidate.current, index)));
        Some((candidate.target.clone(), candidate.through))
    }

    /// Candidates in metric order
    pub fn candidates(&self) -> &[RouteCandidate<T>] {
        &self.candidates
    }

    /// Number of candidates
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Always false; empty heaps are never built
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}
