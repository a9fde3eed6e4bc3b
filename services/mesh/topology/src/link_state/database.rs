//! LinkStateDatabase implementation methods.

use super::{LinkState, LinkStateDatabase, LsdbOutcome, OWNER_ACK};
use crate::metric::ROUTER_DEAD_INTERVAL;
use crate::path::LinkGraph;
use mesh_wire::{LinkStateAck, LinkStateUpdate, NodeAddress};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

impl LinkStateDatabase {
    /// Create an empty database for `local`
    pub fn new(local: NodeAddress) -> Self {
        Self {
            local,
            states: Default::default(),
        }
    }

    /// This node's address
    pub fn local(&self) -> NodeAddress {
        self.local
    }

    /// Install a freshly flooded update authored by this node
    pub fn install_own(&mut self, update: LinkStateUpdate, now: u64) {
        debug!(
            "Installing own link state version {} ({} neighbors)",
            update.version,
            update.state.len()
        );
        self.states.insert(
            self.local,
            LinkState {
                update,
                acked: HashMap::new(),
                installed_at: now,
            },
        );
    }

    /// Apply an update received from `sender` running since `sender_boot`
    pub fn apply_update(
        &mut self,
        sender: NodeAddress,
        sender_boot: u64,
        update: LinkStateUpdate,
        now: u64,
    ) -> LsdbOutcome {
        if update.owner == self.local {
            return LsdbOutcome::SelfOwned;
        }

        match self.states.get_mut(&update.owner) {
            Some(existing) if update.version < existing.update.version => LsdbOutcome::Stale,
            Some(existing) if update.version == existing.update.version => {
                let acked = existing.acked.entry(sender).or_insert(sender_boot);
                if *acked < sender_boot {
                    *acked = sender_boot;
                }
                LsdbOutcome::Acknowledged
            }
            _ => {
                info!(
                    "Installing link state of {} version {} from {}",
                    update.owner, update.version, sender
                );
                let owner = update.owner;
                let mut acked = HashMap::new();
                acked.insert(sender, sender_boot);
                acked.insert(owner, OWNER_ACK);
                self.states.insert(
                    owner,
                    LinkState {
                        update,
                        acked,
                        installed_at: now,
                    },
                );
                LsdbOutcome::Installed
            }
        }
    }

    /// Apply an acknowledgment from `sender` running since `sender_boot`.
    ///
    /// Acks for superseded versions are ignored. Returns whether it counted.
    pub fn apply_ack(&mut self, sender: NodeAddress, sender_boot: u64, ack: &LinkStateAck) -> bool {
        let Some(state) = self.states.get_mut(&ack.owner) else {
            return false;
        };
        if ack.version < state.update.version {
            return false;
        }
        let acked = state.acked.entry(sender).or_insert(sender_boot);
        if *acked < sender_boot {
            *acked = sender_boot;
        }
        true
    }

    /// Entries `neighbor` at `boot_time` has not acknowledged yet
    pub fn pending_for(
        &self,
        neighbor: NodeAddress,
        boot_time: u64,
    ) -> impl Iterator<Item = &LinkState> + '_ {
        self.states
            .values()
            .filter(move |state| state.needs_send(&neighbor, boot_time))
    }

    /// Drop entries of nodes missing from `reachable` once they are older
    /// than the router dead interval. This node's entry is never dropped.
    pub fn prune_unreachable(&mut self, reachable: &HashSet<NodeAddress>, now: u64) -> Vec<NodeAddress> {
        let dead = ROUTER_DEAD_INTERVAL.as_nanos() as u64;
        let local = self.local;
        let mut removed = Vec::new();
        self.states.retain(|owner, state| {
            let keep = *owner == local
                || reachable.contains(owner)
                || now.saturating_sub(state.installed_at) <= dead;
            if !keep {
                removed.push(*owner);
            }
            keep
        });
        if !removed.is_empty() {
            info!("Pruned {} unreachable link states", removed.len());
        }
        removed
    }

    /// Entry of one owner
    pub fn get(&self, owner: &NodeAddress) -> Option<&LinkState> {
        self.states.get(owner)
    }

    /// All entries in owner order
    pub fn iter(&self) -> impl Iterator<Item = (&NodeAddress, &LinkState)> {
        self.states.iter()
    }

    /// Advertised name of `owner`
    pub fn name_of(&self, owner: &NodeAddress) -> Option<&str> {
        self.states.get(owner).map(|s| s.update.name.as_str())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether the database is empty
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    /// JSON view for debug dumps
    pub fn describe(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (owner, state) in &self.states {
            let db: serde_json::Map<String, Value> = state
                .update
                .state
                .iter()
                .map(|(n, m)| (n.to_string(), json!(m)))
                .collect();
            let mut acked: Vec<String> = state.acked.keys().map(|n| n.to_string()).collect();
            acked.sort();
            out.insert(
                owner.to_string(),
                json!({
                    "name": state.update.name,
                    "version": state.update.version,
                    "db": db,
                    "acked": acked,
                }),
            );
        }
        Value::Object(out)
    }
}

impl LinkGraph for LinkStateDatabase {
    fn contains_node(&self, node: &NodeAddress) -> bool {
        self.states.contains_key(node)
    }

    fn edges(&self, node: &NodeAddress) -> Vec<(NodeAddress, u64)> {
        self.states
            .get(node)
            .map(|s| s.update.state.iter().map(|(n, m)| (*n, *m)).collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::shortest_paths;
    use std::collections::BTreeMap;

    fn node(last: u8) -> NodeAddress {
        NodeAddress::new(10, 0, 0, last)
    }

    fn update(owner: NodeAddress, version: u64, edges: &[(NodeAddress, u64)]) -> LinkStateUpdate {
        LinkStateUpdate {
            owner,
            version,
            state: edges.iter().copied().collect::<BTreeMap<_, _>>(),
            name: format!("node-{}", owner.octets()[3]),
        }
    }

    #[test]
    fn test_version_precedence() {
        let mut db = LinkStateDatabase::new(node(1));
        let owner = node(5);

        let first = update(owner, 10, &[(node(2), 7)]);
        assert_eq!(db.apply_update(node(2), 100, first, 0), LsdbOutcome::Installed);
        let state = db.get(&owner).unwrap();
        assert_eq!(state.acked.get(&node(2)), Some(&100));
        assert_eq!(state.acked.get(&owner), Some(&OWNER_ACK));

        // same version: only ack bookkeeping
        let same = update(owner, 10, &[(node(9), 1)]);
        assert_eq!(db.apply_update(node(3), 300, same, 5), LsdbOutcome::Acknowledged);
        let state = db.get(&owner).unwrap();
        assert_eq!(state.update.state.get(&node(2)), Some(&7));
        assert_eq!(state.acked.get(&node(3)), Some(&300));
        assert_eq!(state.installed_at, 0);

        // older version: no-op
        let old = update(owner, 9, &[]);
        assert_eq!(db.apply_update(node(4), 400, old, 6), LsdbOutcome::Stale);
        assert!(db.get(&owner).unwrap().acked.get(&node(4)).is_none());

        // newer version: replace and reset acks
        let newer = update(owner, 11, &[(node(3), 4)]);
        assert_eq!(db.apply_update(node(3), 300, newer, 7), LsdbOutcome::Installed);
        let state = db.get(&owner).unwrap();
        assert_eq!(state.update.version, 11);
        assert_eq!(state.acked.len(), 2);
        assert!(state.acked.get(&node(2)).is_none());
        assert_eq!(state.installed_at, 7);
    }

    #[test]
    fn test_ack_never_regresses() {
        let mut db = LinkStateDatabase::new(node(1));
        db.apply_update(node(2), 100, update(node(5), 10, &[]), 0);
        db.apply_update(node(2), 50, update(node(5), 10, &[]), 0);
        assert_eq!(db.get(&node(5)).unwrap().acked.get(&node(2)), Some(&100));

        let ack = LinkStateAck { owner: node(5), version: 10 };
        assert!(db.apply_ack(node(2), 20, &ack));
        assert_eq!(db.get(&node(5)).unwrap().acked.get(&node(2)), Some(&100));
        assert!(db.apply_ack(node(2), 200, &ack));
        assert_eq!(db.get(&node(5)).unwrap().acked.get(&node(2)), Some(&200));
    }

    #[test]
    fn test_stale_ack_ignored() {
        let mut db = LinkStateDatabase::new(node(1));
        db.install_own(update(node(1), 10, &[(node(2), 5)]), 0);
        let stale = LinkStateAck { owner: node(1), version: 9 };
        assert!(!db.apply_ack(node(2), 7, &stale));
        assert!(db.get(&node(1)).unwrap().needs_send(&node(2), 7));

        let current = LinkStateAck { owner: node(1), version: 10 };
        assert!(db.apply_ack(node(2), 7, &current));
        assert!(!db.get(&node(1)).unwrap().needs_send(&node(2), 7));
        // the neighbor restarted since acknowledging
        assert!(db.get(&node(1)).unwrap().needs_send(&node(2), 8));

        let unknown = LinkStateAck { owner: node(9), version: 1 };
        assert!(!db.apply_ack(node(2), 7, &unknown));
    }

    #[test]
    fn test_self_owned_rejected() {
        let mut db = LinkStateDatabase::new(node(1));
        let forged = update(node(1), u64::MAX, &[]);
        assert_eq!(db.apply_update(node(2), 1, forged, 0), LsdbOutcome::SelfOwned);
        assert!(db.is_empty());
    }

    #[test]
    fn test_pending_for() {
        let mut db = LinkStateDatabase::new(node(1));
        db.install_own(update(node(1), 10, &[(node(2), 5)]), 0);
        db.apply_update(node(2), 3, update(node(5), 10, &[]), 0);

        let pending: Vec<NodeAddress> = db.pending_for(node(2), 3).map(|s| s.update.owner).collect();
        assert_eq!(pending, vec![node(1)]);
        let pending: Vec<NodeAddress> = db.pending_for(node(3), 1).map(|s| s.update.owner).collect();
        assert_eq!(pending, vec![node(1), node(5)]);
        // the owner never needs its own entry back
        assert_eq!(db.pending_for(node(5), 99).count(), 1);
    }

    #[test]
    fn test_prune_unreachable() {
        let dead = ROUTER_DEAD_INTERVAL.as_nanos() as u64;
        let mut db = LinkStateDatabase::new(node(1));
        db.install_own(update(node(1), 1, &[]), 0);
        db.apply_update(node(2), 1, update(node(5), 1, &[]), 0);
        db.apply_update(node(2), 1, update(node(6), 1, &[]), 0);
        db.apply_update(node(2), 1, update(node(7), 1, &[]), dead);

        let reachable: HashSet<NodeAddress> = [node(1), node(6)].into_iter().collect();
        let removed = db.prune_unreachable(&reachable, dead + 1);
        assert_eq!(removed, vec![node(5)]);
        assert!(db.get(&node(1)).is_some());
        assert!(db.get(&node(6)).is_some());
        assert!(db.get(&node(7)).is_some());
    }

    #[test]
    fn test_graph_view() {
        let mut db = LinkStateDatabase::new(node(1));
        db.install_own(update(node(1), 1, &[(node(2), 5)]), 0);
        db.apply_update(node(2), 1, update(node(2), 1, &[(node(1), 5), (node(3), 7)]), 0);
        db.apply_update(node(2), 1, update(node(3), 1, &[(node(2), 7)]), 0);

        let paths = shortest_paths(&db, node(1), None);
        assert_eq!(paths[&node(3)].distance, 12);
        assert_eq!(db.name_of(&node(3)), Some("node-3"));

        let dump = db.describe();
        assert_eq!(dump["10.0.0.2"]["db"]["10.0.0.3"], 7);
        assert_eq!(dump["10.0.0.3"]["version"], 1);
    }
}
