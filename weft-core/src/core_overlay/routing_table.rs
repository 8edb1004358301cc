/*
    RoutingTable - the prefix routing fabric

    Responsibilities:
    `routing_table.rs` implements the per-level, per-digit routing grid. A
    peer that lands on level n shares a prefix of length n with the local
    node and sits in the column of its first differing digit. It performs:
    insertion with farthest-eviction when a slot is full, removal, level
    snapshots, and the right-surrogate next-hop scan.

    Inputs:
    - peers learned from joins, multicasts, backpointer walks and transfers
    - eviction requests after failed remote calls

    Outputs:
    - next-hop decisions for surrogate routing
    - displaced peers that need a backpointer-removal notice
*/

use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};

use super::node_id::NodeId;
use super::{BASE, DIGITS, SLOT_SIZE};

/// A peer reference: identifier plus transport address. Equality is
/// structural; there is no global peer registry behind these.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteNode {
    pub id: NodeId,
    pub address: String,
}

impl RemoteNode {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        RemoteNode {
            id,
            address: address.into(),
        }
    }

    /// The "no peer" value: all-zero identifier and no address.
    pub fn empty() -> Self {
        RemoteNode {
            id: NodeId::default(),
            address: String::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.id.is_zero() && self.address.is_empty()
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let hex = self.id.to_hex();
        write!(f, "{}@{}", &hex[..8], self.address)
    }
}

type Rows = Box<[[Vec<RemoteNode>; BASE]; DIGITS]>;

/// The routing table. Each slot holds at most [`SLOT_SIZE`] peers ordered by
/// absolute distance from the local node, and every row is seeded with the
/// local node in its own digit column.
pub struct RoutingTable {
    local: RemoteNode,
    rows: Mutex<Rows>,
}

impl RoutingTable {
    pub fn new(local: RemoteNode) -> Self {
        let mut rows: Rows = Box::new(std::array::from_fn(|_| {
            std::array::from_fn(|_| Vec::with_capacity(SLOT_SIZE))
        }));
        for level in 0..DIGITS {
            rows[level][local.id.digit(level) as usize].push(local.clone());
        }
        RoutingTable {
            local,
            rows: Mutex::new(rows),
        }
    }

    pub fn local(&self) -> &RemoteNode {
        &self.local
    }

    fn rows(&self) -> MutexGuard<'_, Rows> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add `node` to its slot.
    ///
    /// Returns whether the node was inserted and, when a full slot preferred
    /// the newcomer, the peer it displaced. The local node is never inserted
    /// and never displaced.
    pub fn add(&self, node: &RemoteNode) -> (bool, Option<RemoteNode>) {
        if node.id == self.local.id {
            return (false, None);
        }

        let level = self.local.id.shared_prefix_length(&node.id);
        let digit = node.id.digit(level) as usize;
        let local_id = self.local.id;

        let mut rows = self.rows();
        let slot = &mut rows[level][digit];
        if slot.iter().any(|existing| existing == node) {
            return (false, None);
        }

        if slot.len() < SLOT_SIZE {
            slot.push(node.clone());
            slot.sort_by(|a, b| local_id.distance(&a.id).cmp(&local_id.distance(&b.id)));
            return (true, None);
        }

        // Slot is full and kept sorted, so the last entry is the farthest.
        if local_id.closer(&node.id, &slot[SLOT_SIZE - 1].id) {
            let evicted = slot.pop();
            slot.push(node.clone());
            slot.sort_by(|a, b| local_id.distance(&a.id).cmp(&local_id.distance(&b.id)));
            return (true, evicted);
        }

        (false, None)
    }

    /// Remove `node` from its slot, if present. Removing the local node is
    /// rejected.
    pub fn remove(&self, node: &RemoteNode) -> bool {
        if node.id == self.local.id {
            return false;
        }
        let level = self.local.id.shared_prefix_length(&node.id);
        let digit = node.id.digit(level) as usize;
        let mut rows = self.rows();
        let slot = &mut rows[level][digit];
        match slot.iter().position(|existing| existing == node) {
            Some(index) => {
                slot.remove(index);
                true
            }
            None => false,
        }
    }

    /// All peers on `level`, excluding the local node.
    pub fn get_level(&self, level: usize) -> Vec<RemoteNode> {
        if level >= DIGITS {
            return Vec::new();
        }
        let rows = self.rows();
        rows[level]
            .iter()
            .flatten()
            .filter(|node| node.id != self.local.id)
            .cloned()
            .collect()
    }

    /// The closest next hop toward `target`, scanning right-modulo from the
    /// target digit and descending a level whenever the scan lands back on
    /// the local node. Returns the local node when no level routes closer.
    pub fn find_next_hop(&self, target: &NodeId, start_level: usize) -> RemoteNode {
        let rows = self.rows();
        for level in start_level.min(DIGITS)..DIGITS {
            let mut column = target.digit(level) as usize;
            for _ in 0..BASE {
                let slot = &rows[level][column];
                if !slot.is_empty() {
                    let candidate = closest_to(target, slot);
                    if candidate.id != self.local.id {
                        return candidate.clone();
                    }
                    break;
                }
                column = (column + 1) % BASE;
            }
        }
        self.local.clone()
    }

    /// Whether the table holds this exact peer reference.
    pub fn contains(&self, node: &RemoteNode) -> bool {
        let rows = self.rows();
        rows.iter().flatten().flatten().any(|entry| entry == node)
    }

    /// Human-readable rendering for the shell's `table` command.
    pub fn dump(&self) -> String {
        let rows = self.rows();
        let mut out = format!("Routing table for node {}\n", self.local);
        let local_hex = self.local.id.to_hex();
        for (level, row) in rows.iter().enumerate() {
            for (column, slot) in row.iter().enumerate() {
                for node in slot {
                    let _ = writeln!(
                        out,
                        " {:>width$}[{:X}]  {} {}",
                        &local_hex[..level],
                        column,
                        node.address,
                        node.id.to_hex(),
                        width = level,
                    );
                }
            }
        }
        out
    }
}

/// The entry of `slot` closest to `target` by absolute distance.
fn closest_to<'a>(target: &NodeId, slot: &'a [RemoteNode]) -> &'a RemoteNode {
    let mut result = &slot[0];
    for node in slot {
        if target.closer(&node.id, &result.id) {
            result = node;
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(prefix: &str) -> RemoteNode {
        RemoteNode::new(
            NodeId::from_prefix(prefix).unwrap(),
            format!("127.0.0.1:{}", prefix),
        )
    }

    fn table(prefix: &str) -> RoutingTable {
        RoutingTable::new(node(prefix))
    }

    #[test]
    fn test_local_seeded_in_every_row() {
        let table = table("1234");
        let local = table.local().clone();
        for level in 0..DIGITS {
            let rows = table.rows();
            let column = local.id.digit(level) as usize;
            assert!(rows[level][column].contains(&local));
        }
    }

    #[test]
    fn test_add_places_peer_by_prefix_and_digit() {
        let table = table("1234");
        let peer = node("1299");
        let (added, evicted) = table.add(&peer);
        assert!(added);
        assert!(evicted.is_none());

        // spl("1234", "1299") == 2, digit 9.
        let rows = table.rows();
        assert!(rows[2][9].contains(&peer));
    }

    #[test]
    fn test_add_rejects_local_and_duplicates() {
        let table = table("1234");
        assert_eq!(table.add(&table.local().clone()), (false, None));

        let peer = node("9");
        assert_eq!(table.add(&peer), (true, None));
        assert_eq!(table.add(&peer), (false, None));
    }

    #[test]
    fn test_full_slot_evicts_farthest_for_closer_peer() {
        let table = table("1");
        // All of these land in slot [0][3].
        assert_eq!(table.add(&node("341")), (true, None));
        assert_eq!(table.add(&node("342")), (true, None));
        assert_eq!(table.add(&node("343")), (true, None));

        // 300... is closer to 100... than 343..., which gets displaced.
        let (added, evicted) = table.add(&node("300"));
        assert!(added);
        assert_eq!(evicted, Some(node("343")));

        // 357... is farther than everything already there.
        let (added, evicted) = table.add(&node("357"));
        assert!(!added);
        assert!(evicted.is_none());
    }

    #[test]
    fn test_slot_entries_stay_sorted_by_distance() {
        let table = table("1");
        table.add(&node("343"));
        table.add(&node("341"));
        table.add(&node("342"));

        let rows = table.rows();
        let slot = &rows[0][3];
        assert_eq!(slot.len(), SLOT_SIZE);
        for pair in slot.windows(2) {
            assert!(!table.local.id.closer(&pair[1].id, &pair[0].id));
        }
    }

    #[test]
    fn test_remove() {
        let table = table("1234");
        let peer = node("1299");
        table.add(&peer);
        assert!(table.contains(&peer));
        assert!(table.remove(&peer));
        assert!(!table.contains(&peer));
        assert!(!table.remove(&peer));
        assert!(!table.remove(&table.local().clone()));
    }

    #[test]
    fn test_get_level_excludes_local() {
        let table = table("1234");
        table.add(&node("1299"));
        table.add(&node("1255"));
        table.add(&node("9999"));

        let level2 = table.get_level(2);
        assert_eq!(level2.len(), 2);
        assert!(level2.contains(&node("1299")));
        assert!(level2.contains(&node("1255")));
        assert!(table.get_level(1).is_empty());
        assert!(table.get_level(DIGITS).is_empty());
    }

    #[test]
    fn test_find_next_hop_scans_right_from_target_digit() {
        let table = table("1");
        table.add(&node("3"));
        table.add(&node("5"));
        table.add(&node("7"));

        let target = NodeId::from_prefix("2").unwrap();
        assert_eq!(table.find_next_hop(&target, 0), node("3"));

        table.remove(&node("3"));
        assert_eq!(table.find_next_hop(&target, 0), node("5"));

        table.remove(&node("5"));
        assert_eq!(table.find_next_hop(&target, 0), node("7"));
    }

    #[test]
    fn test_find_next_hop_returns_local_when_alone() {
        let table = table("1234");
        let target = NodeId::from_prefix("9").unwrap();
        assert_eq!(table.find_next_hop(&target, 0), *table.local());
        assert_eq!(table.find_next_hop(&target, DIGITS), *table.local());
    }

    #[test]
    fn test_find_next_hop_descends_past_own_column() {
        let table = table("1234");
        let deeper = node("1239");
        table.add(&deeper);

        // The level-0 scan from digit 1 lands on the local column, so the
        // search descends until it finds the longer-prefix peer.
        let target = NodeId::from_prefix("1230").unwrap();
        assert_eq!(table.find_next_hop(&target, 0), deeper);
    }

    #[test]
    fn test_find_next_hop_picks_closest_in_slot() {
        let table = table("1");
        table.add(&node("341"));
        table.add(&node("343"));

        let target = NodeId::from_prefix("343").unwrap();
        assert_eq!(table.find_next_hop(&target, 0), node("343"));
    }
}
