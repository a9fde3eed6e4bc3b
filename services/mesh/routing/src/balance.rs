//! Shortest and balanced route computation from the link-state database.

use mesh_topology::{
    shortest_paths, AdjacencyTable, CandidateHeap, LinkStateDatabase, RouteCandidate, MAX_METRIC,
};
use mesh_wire::NodeAddress;
use std::collections::HashMap;
use std::hash::Hash;

/// Next hop of the shortest path to every reachable node
pub fn calc_shortest(db: &LinkStateDatabase) -> HashMap<NodeAddress, NodeAddress> {
    let local = db.local();
    shortest_paths(db, local, None)
        .into_iter()
        .filter(|(dst, _)| *dst != local)
        .filter_map(|(dst, path)| path.next_hop().map(|next| (dst, next)))
        .collect()
}

/// Balanced next-hop candidates for every known node.
///
/// For each usable adjacency `A`, paths are computed from `A` without
/// passing back through this node. A destination reachable from `A`
/// yields the candidate `(A, through, dist(A, dst) + metric(A))`, where
/// `through` is the node right before the destination.
pub fn calc_balance<R: Clone + Eq + Hash>(
    adjacencies: &AdjacencyTable<R>,
    db: &LinkStateDatabase,
) -> HashMap<NodeAddress, CandidateHeap<NodeAddress>> {
    let local = db.local();
    let mut candidates: HashMap<NodeAddress, Vec<RouteCandidate<NodeAddress>>> = HashMap::new();

    for (adjacent, adjacency) in adjacencies.iter() {
        let first_hop = adjacency.metric();
        if first_hop >= MAX_METRIC {
            continue;
        }
        for (dst, path) in shortest_paths(db, *adjacent, Some(local)) {
            if dst == local {
                continue;
            }
            let through = if dst == *adjacent {
                *adjacent
            } else {
                match path.penultimate() {
                    Some(node) => node,
                    None => continue,
                }
            };
            candidates.entry(dst).or_default().push(RouteCandidate::new(
                *adjacent,
                through,
                path.distance.saturating_add(first_hop),
            ));
        }
    }

    candidates
        .into_iter()
        .filter_map(|(dst, list)| CandidateHeap::new(list).map(|heap| (dst, heap)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_topology::Weighting;
    use mesh_wire::LinkStateUpdate;
    use std::collections::BTreeMap;

    fn node(last: u8) -> NodeAddress {
        NodeAddress::new(10, 0, 0, last)
    }

    fn install(db: &mut LinkStateDatabase, owner: NodeAddress, edges: &[(u8, u64)]) {
        let update = LinkStateUpdate {
            owner,
            version: 1,
            state: edges.iter().map(|(n, m)| (node(*n), *m)).collect::<BTreeMap<_, _>>(),
            name: String::new(),
        };
        if owner == db.local() {
            db.install_own(update, 0);
        } else {
            db.apply_update(owner, 1, update, 0);
        }
    }

    /// 1 is adjacent to 2 (metric 10) and 3 (metric 12); both reach 4
    fn diamond() -> (AdjacencyTable<&'static str>, LinkStateDatabase) {
        let mut adjacencies = AdjacencyTable::new();
        adjacencies.update(node(2), 1, "to-2", 10, 0);
        adjacencies.update(node(3), 1, "to-3", 12, 0);

        let mut db = LinkStateDatabase::new(node(1));
        install(&mut db, node(1), &[(2, 10), (3, 12)]);
        install(&mut db, node(2), &[(1, 10), (4, 5)]);
        install(&mut db, node(3), &[(1, 12), (4, 4)]);
        install(&mut db, node(4), &[(2, 5), (3, 4)]);
        (adjacencies, db)
    }

    #[test]
    fn test_calc_shortest() {
        let (_, db) = diamond();
        let shortest = calc_shortest(&db);
        assert_eq!(shortest.get(&node(2)), Some(&node(2)));
        assert_eq!(shortest.get(&node(4)), Some(&node(2)));
        assert!(shortest.get(&node(1)).is_none());
    }

    #[test]
    fn test_calc_balance_spreads_over_neighbors() {
        let (adjacencies, db) = diamond();
        let balance = calc_balance(&adjacencies, &db);

        let to_4 = &balance[&node(4)];
        let mut options: Vec<(NodeAddress, NodeAddress, u64)> = to_4
            .candidates()
            .iter()
            .map(|c| (c.target, c.through, c.metric))
            .collect();
        options.sort();
        assert_eq!(options, vec![(node(2), node(2), 15), (node(3), node(3), 16)]);

        // the adjacent destination itself is a candidate through itself
        let to_2 = &balance[&node(2)];
        assert_eq!(to_2.candidates()[0].target, node(2));
        assert_eq!(to_2.candidates()[0].through, node(2));
        assert_eq!(to_2.candidates()[0].metric, 10);
        assert!(!balance.contains_key(&node(1)));
    }

    #[test]
    fn test_calc_balance_prunes_detours() {
        let (adjacencies, db) = diamond();
        let mut balance = calc_balance(&adjacencies, &db);
        // via 3 to reach 2 costs 12 + 4 + 5 = 21 > 10 * 1.39
        let to_2 = balance.get_mut(&node(2)).unwrap();
        assert_eq!(to_2.len(), 1);
        assert_eq!(to_2.select(Weighting::Squared), Some((node(2), node(2))));
    }

    #[test]
    fn test_through_is_penultimate_hop() {
        let mut adjacencies = AdjacencyTable::new();
        adjacencies.update(node(2), 1, "to-2", 10, 0);
        let mut db = LinkStateDatabase::new(node(1));
        install(&mut db, node(1), &[(2, 10)]);
        install(&mut db, node(2), &[(1, 10), (3, 1)]);
        install(&mut db, node(3), &[(2, 1), (5, 1)]);
        install(&mut db, node(5), &[(3, 1)]);

        let balance = calc_balance(&adjacencies, &db);
        let to_5 = &balance[&node(5)].candidates()[0];
        assert_eq!(to_5.target, node(2));
        assert_eq!(to_5.through, node(3));
        assert_eq!(to_5.metric, 12);
    }
}
