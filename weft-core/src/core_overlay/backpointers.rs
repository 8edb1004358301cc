/*
    Backpointers - who routes through us

    A backpointer at level n is a peer that shares a prefix of length n with
    the local node and holds us somewhere in level n of its own routing
    table. The sets are mutated only by explicit add/remove notices from the
    peers themselves and are read back out during graceful leave and the
    join-time backpointer traversal.
*/

use std::collections::HashSet;
use std::fmt::Write as _;
use std::sync::{Mutex, MutexGuard};

use super::routing_table::RemoteNode;
use super::DIGITS;

/// A mutex-guarded set of peers.
pub struct NodeSet {
    data: Mutex<HashSet<RemoteNode>>,
}

impl NodeSet {
    pub fn new() -> Self {
        NodeSet {
            data: Mutex::new(HashSet::new()),
        }
    }

    fn data(&self) -> MutexGuard<'_, HashSet<RemoteNode>> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns true if the node was not already present.
    pub fn add(&self, node: &RemoteNode) -> bool {
        self.data().insert(node.clone())
    }

    /// Returns true if the node was present.
    pub fn remove(&self, node: &RemoteNode) -> bool {
        self.data().remove(node)
    }

    pub fn contains(&self, node: &RemoteNode) -> bool {
        self.data().contains(node)
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    /// Snapshot of the set.
    pub fn nodes(&self) -> Vec<RemoteNode> {
        self.data().iter().cloned().collect()
    }
}

impl Default for NodeSet {
    fn default() -> Self {
        NodeSet::new()
    }
}

/// Per-level backpointer sets, indexed like the routing table.
pub struct Backpointers {
    local: RemoteNode,
    sets: [NodeSet; DIGITS],
}

impl Backpointers {
    pub fn new(local: RemoteNode) -> Self {
        Backpointers {
            local,
            sets: std::array::from_fn(|_| NodeSet::new()),
        }
    }

    /// Record that `node` routes through us. The local node is rejected.
    /// Returns true if the backpointer was new.
    pub fn add(&self, node: &RemoteNode) -> bool {
        if node.id == self.local.id {
            return false;
        }
        self.level_set(node).add(node)
    }

    /// Drop the backpointer for `node`, if present.
    pub fn remove(&self, node: &RemoteNode) -> bool {
        if node.id == self.local.id {
            return false;
        }
        self.level_set(node).remove(node)
    }

    /// Snapshot of the backpointers at `level`.
    pub fn get(&self, level: usize) -> Vec<RemoteNode> {
        if level >= DIGITS {
            return Vec::new();
        }
        self.sets[level].nodes()
    }

    fn level_set(&self, node: &RemoteNode) -> &NodeSet {
        &self.sets[self.local.id.shared_prefix_length(&node.id)]
    }

    /// Human-readable rendering for the shell's `backpointers` command.
    pub fn dump(&self) -> String {
        let mut out = format!("Backpointers for node {}\n", self.local);
        for (level, set) in self.sets.iter().enumerate() {
            for node in set.nodes() {
                let _ = writeln!(out, " {:>2}  {} {}", level, node.address, node.id.to_hex());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::super::node_id::NodeId;
    use super::*;

    fn node(prefix: &str) -> RemoteNode {
        RemoteNode::new(
            NodeId::from_prefix(prefix).unwrap(),
            format!("127.0.0.1:{}", prefix),
        )
    }

    #[test]
    fn test_node_set_add_remove() {
        let set = NodeSet::new();
        assert!(set.add(&node("12")));
        assert!(!set.add(&node("12")));
        assert_eq!(set.len(), 1);
        assert!(set.contains(&node("12")));
        assert!(set.remove(&node("12")));
        assert!(!set.remove(&node("12")));
        assert!(set.is_empty());
    }

    #[test]
    fn test_backpointers_level_placement() {
        let backpointers = Backpointers::new(node("1234"));
        assert!(backpointers.add(&node("1299")));
        assert!(backpointers.add(&node("9999")));

        assert_eq!(backpointers.get(2), vec![node("1299")]);
        assert_eq!(backpointers.get(0), vec![node("9999")]);
        assert!(backpointers.get(1).is_empty());
        assert!(backpointers.get(DIGITS).is_empty());
    }

    #[test]
    fn test_backpointers_reject_local() {
        let local = node("1234");
        let backpointers = Backpointers::new(local.clone());
        assert!(!backpointers.add(&local));
        assert!(!backpointers.remove(&local));
    }

    #[test]
    fn test_backpointers_remove() {
        let backpointers = Backpointers::new(node("1234"));
        backpointers.add(&node("1299"));
        assert!(backpointers.remove(&node("1299")));
        assert!(!backpointers.remove(&node("1299")));
        assert!(backpointers.get(2).is_empty());
    }
}
