//! Latency metrics, adjacencies, link-state database and path computation for mesh.
//!
//! This crate holds the pure, clock-driven state of the routing protocol.
//! Nothing here performs I/O; every time-dependent operation takes the
//! current monotonic time explicitly so it can be driven by a
//! [`ManualClock`] in tests.
//!
//! - **Metric estimation**: windowed RTT averages penalized by missed Hellos
//! - **Adjacency table**: per-neighbor route sets with flood hysteresis
//! - **Link-state database**: versioned per-owner state with ack tracking
//! - **Path engine**: directed Dijkstra over advertised metrics
//! - **Candidates**: pruned weighted round-robin heaps

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adjacency;
pub mod candidate;
pub mod clock;
pub mod link_state;
pub mod metric;
pub mod path;

pub use adjacency::{Adjacency, AdjacencyTable, AdjacencyUpdate};
pub use candidate::{prune, CandidateHeap, RouteCandidate, Weighting};
pub use clock::{wall_nanos, Clock, ManualClock, MonotonicClock};
pub use link_state::{LinkState, LinkStateDatabase, LsdbOutcome, OWNER_ACK};
pub use metric::{
    MetricEstimator, RttSample, AVERAGE_WINDOW, HELLO_INTERVAL, MAX_METRIC, ROUTER_DEAD_INTERVAL,
    UPDATE_THRESHOLD,
};
pub use path::{shortest_paths, LinkGraph, Path};
