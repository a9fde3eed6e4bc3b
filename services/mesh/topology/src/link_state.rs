//! Link-state database.
//!
//! One entry per known node, self included. Entries are replaced wholesale
//! by strictly newer versions; acknowledgments for the current version
//! accumulate per neighbor and only move forward.

use mesh_wire::{LinkStateUpdate, NodeAddress};
use std::collections::{BTreeMap, HashMap};

/// Boot time recorded for an owner's acknowledgment of its own update
pub const OWNER_ACK: u64 = u64::MAX;

/// Stored link state of one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkState {
    /// Last update authored by the owner
    pub update: LinkStateUpdate,
    /// Neighbor -> highest boot time that acknowledged this version
    pub acked: HashMap<NodeAddress, u64>,
    /// Monotonic time the entry was installed
    pub installed_at: u64,
}

impl LinkState {
    /// Whether `neighbor`, currently at `boot_time`, still needs this version
    pub fn needs_send(&self, neighbor: &NodeAddress, boot_time: u64) -> bool {
        self.acked
            .get(neighbor)
            .map_or(true, |acked| *acked < boot_time)
    }
}

/// Result of applying a received update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsdbOutcome {
    /// Newer version stored; routes must be recomputed
    Installed,
    /// Same version; only the sender's acknowledgment moved
    Acknowledged,
    /// Older version ignored
    Stale,
    /// Update claims to be authored by this node
    SelfOwned,
}

/// Link-state database
#[derive(Debug, Clone)]
pub struct LinkStateDatabase {
    local: NodeAddress,
    states: BTreeMap<NodeAddress, LinkState>,
}

// Include implementation
mod database;
