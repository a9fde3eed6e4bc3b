//! Routing error types.

use mesh_wire::NodeAddress;
use thiserror::Error;

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// No route to the node; frequent and expected while the mesh converges
    #[error("no route to {0}")]
    NoRoute(NodeAddress),

    /// Malformed static route
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// Engine inbound queue is full
    #[error("routing queue full")]
    QueueFull,

    /// Engine task has stopped
    #[error("routing engine stopped")]
    EngineStopped,
}
