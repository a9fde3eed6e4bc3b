//! Route computation, protocol engine and packet forwarding for mesh.
//!
//! This crate ties the topology model to the data plane:
//!
//! - **Balance**: shortest and load-balanced next hops from the link-state database
//! - **Table**: route snapshots shared between the engine and forwarding tasks
//! - **Prefix**: static routes for destinations outside the overlay
//! - **Engine**: the link-state protocol actor (Hellos, flooding, acks)
//! - **Router**: the forwarding loop between links, tunnel and engine

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod balance;
pub mod engine;
pub mod error;
pub mod prefix;
pub mod router;
pub mod table;

pub use balance::{calc_balance, calc_shortest};
pub use engine::{
    EngineConfig, EngineHandle, Neighbor, ProtocolEngine, RoutingPacket, ADJACENCY_CHECK_INTERVAL,
    ENGINE_QUEUE_CAPACITY, FLOOD_INTERVAL, RETRY_INTERVAL,
};
pub use error::RoutingError;
pub use prefix::{PrefixRoute, PrefixTable};
pub use router::{Disposition, DropReason, Router, RouterConfig, RouterHandle};
pub use table::{RouteSnapshot, RouteTable};
