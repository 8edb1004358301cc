/*
    LocationMap - the soft-state advertiser index

    Responsibilities:
    `location_map.rs` stores, at a key's root node, the set of peers
    advertising that key. Every (key, advertiser) pair carries an expiry
    task; re-registration replaces the task and so resets the deadline. When
    a newly joined node surrogates for some of our keys, the transfer set is
    removed here and handed to it in one message.

    Inputs:
    - register calls from advertisers, directly or via bulk transfer
    - expiry timer firings
    - transfer-set extraction when a better root joins

    Outputs:
    - advertiser snapshots for fetch
    - removed entry maps for hand-off (and rollback on a failed hand-off)
*/

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

use super::node_id::NodeId;
use super::routing_table::RemoteNode;

type Entries = HashMap<String, HashMap<RemoteNode, Registration>>;

/// One advertiser registration and its pending expiry task.
struct Registration {
    expiry: AbortHandle,
    generation: u64,
}

/// Multimap key -> advertiser -> registration. Entries expire unless
/// refreshed; an expired or removed registration always has its timer task
/// aborted.
pub struct LocationMap {
    data: Arc<Mutex<Entries>>,
    generations: AtomicU64,
}

impl LocationMap {
    pub fn new() -> Self {
        LocationMap {
            data: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }

    fn data(&self) -> MutexGuard<'_, Entries> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `replica` as advertising `key` for `ttl`. A repeat
    /// registration resets the deadline. Returns true if the pair was new.
    pub fn register(&self, key: &str, replica: &RemoteNode, ttl: Duration) -> bool {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data();
        let expiry = self.spawn_expiry(key.to_string(), replica.clone(), ttl, generation);
        let replicas = data.entry(key.to_string()).or_default();
        let previous = replicas.insert(replica.clone(), Registration { expiry, generation });
        match previous {
            Some(old) => {
                old.expiry.abort();
                false
            }
            None => true,
        }
    }

    /// Bulk registration, used when accepting a transfer (or rolling back a
    /// failed one). Every pair gets a fresh deadline.
    pub fn register_all(&self, replica_map: HashMap<String, Vec<RemoteNode>>, ttl: Duration) {
        for (key, replicas) in replica_map {
            for replica in replicas {
                self.register(&key, &replica, ttl);
            }
        }
    }

    /// Drop the registration of `replica` for `key`. Returns whether it
    /// existed.
    pub fn unregister(&self, key: &str, replica: &RemoteNode) -> bool {
        let mut data = self.data();
        let Some(replicas) = data.get_mut(key) else {
            return false;
        };
        let existed = match replicas.remove(replica) {
            Some(registration) => {
                registration.expiry.abort();
                true
            }
            None => false,
        };
        if replicas.is_empty() {
            data.remove(key);
        }
        existed
    }

    /// Drop every registration for `key`, returning the advertisers that
    /// were present.
    pub fn unregister_all(&self, key: &str) -> Vec<RemoteNode> {
        let mut data = self.data();
        match data.remove(key) {
            Some(replicas) => replicas
                .into_iter()
                .map(|(node, registration)| {
                    registration.expiry.abort();
                    node
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Snapshot of the advertisers for `key`.
    pub fn get(&self, key: &str) -> Vec<RemoteNode> {
        self.data()
            .get(key)
            .map(|replicas| replicas.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove and return every key that `remote` now surrogates for better
    /// than `local` does. The caller owns the hand-off; if it fails, the
    /// returned map must be re-registered.
    pub fn get_transfer_set(
        &self,
        local: &RemoteNode,
        remote: &RemoteNode,
    ) -> HashMap<String, Vec<RemoteNode>> {
        let mut data = self.data();
        let moving: Vec<String> = data
            .keys()
            .filter(|key| NodeId::hash(key).is_better_route(&remote.id, &local.id))
            .cloned()
            .collect();

        let mut transfer = HashMap::new();
        for key in moving {
            if let Some(replicas) = data.remove(&key) {
                let nodes = replicas
                    .into_iter()
                    .map(|(node, registration)| {
                        registration.expiry.abort();
                        node
                    })
                    .collect();
                transfer.insert(key, nodes);
            }
        }
        transfer
    }

    /// Drop everything, aborting all pending expiry tasks.
    pub fn clear(&self) {
        let mut data = self.data();
        for (_, replicas) in data.drain() {
            for registration in replicas.into_values() {
                registration.expiry.abort();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.data().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable rendering for the shell's `replicas` command.
    pub fn dump(&self) -> String {
        let data = self.data();
        let mut out = String::from("Location map\n");
        for (key, replicas) in data.iter() {
            let nodes: Vec<String> = replicas.keys().map(|node| node.to_string()).collect();
            let _ = writeln!(out, " {}: [{}]", key, nodes.join(", "));
        }
        out
    }

    fn spawn_expiry(
        &self,
        key: String,
        replica: RemoteNode,
        ttl: Duration,
        generation: u64,
    ) -> AbortHandle {
        let data = Arc::clone(&self.data);
        let task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let mut data = data.lock().unwrap_or_else(|e| e.into_inner());
            let Some(replicas) = data.get_mut(&key) else {
                return;
            };
            // A racing re-registration may have replaced this timer after it
            // already woke; the generation tells the firings apart.
            let current = replicas
                .get(&replica)
                .is_some_and(|registration| registration.generation == generation);
            if current {
                debug!(key = %key, replica = %replica, "advertiser registration expired");
                replicas.remove(&replica);
                if replicas.is_empty() {
                    data.remove(&key);
                }
            }
        });
        task.abort_handle()
    }
}

impl Default for LocationMap {
    fn default() -> Self {
        LocationMap::new()
    }
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

    async fn run_expiries() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    const TTL: Duration = Duration::from_secs(25);

    #[tokio::test(start_paused = true)]
    async fn test_register_and_get() {
        let map = LocationMap::new();
        assert!(map.register("key", &node("1"), TTL));
        assert!(!map.register("key", &node("1"), TTL));
        assert!(map.register("key", &node("2"), TTL));

        let mut replicas = map.get("key");
        replicas.sort_by_key(|n| n.address.clone());
        assert_eq!(replicas, vec![node("1"), node("2")]);
        assert!(map.get("other").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let map = LocationMap::new();
        map.register("key", &node("1"), TTL);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        run_expiries().await;

        assert!(map.get("key").is_empty());
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_resets_deadline() {
        let map = LocationMap::new();
        map.register("key", &node("1"), TTL);

        tokio::time::advance(TTL / 2).await;
        run_expiries().await;
        map.register("key", &node("1"), TTL);

        // Past the original deadline but within the refreshed one.
        tokio::time::advance(TTL / 2 + Duration::from_secs(1)).await;
        run_expiries().await;
        assert_eq!(map.get("key"), vec![node("1")]);

        tokio::time::advance(TTL).await;
        run_expiries().await;
        assert!(map.get("key").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister() {
        let map = LocationMap::new();
        map.register("key", &node("1"), TTL);
        map.register("key", &node("2"), TTL);

        assert!(map.unregister("key", &node("1")));
        assert!(!map.unregister("key", &node("1")));
        assert_eq!(map.get("key"), vec![node("2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_all() {
        let map = LocationMap::new();
        map.register("key", &node("1"), TTL);
        map.register("key", &node("2"), TTL);

        let mut removed = map.unregister_all("key");
        removed.sort_by_key(|n| n.address.clone());
        assert_eq!(removed, vec![node("1"), node("2")]);
        assert!(map.unregister_all("key").is_empty());
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_all_sets_fresh_deadlines() {
        let map = LocationMap::new();
        let mut bulk = HashMap::new();
        bulk.insert("a".to_string(), vec![node("1"), node("2")]);
        bulk.insert("b".to_string(), vec![node("3")]);
        map.register_all(bulk, TTL);

        assert_eq!(map.len(), 3);
        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        run_expiries().await;
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_set_moves_better_surrogated_keys() {
        let local = node("1");
        let map = LocationMap::new();
        map.register("moving", &node("9"), TTL);

        // A joiner whose identifier is the key's own hash surrogates for it
        // better than any other node can.
        let joiner = RemoteNode::new(NodeId::hash("moving"), "127.0.0.1:9000");
        let transfer = map.get_transfer_set(&local, &joiner);

        assert_eq!(transfer.len(), 1);
        assert_eq!(transfer["moving"], vec![node("9")]);
        assert!(map.get("moving").is_empty());

        // A rolled-back transfer re-registers with a fresh deadline.
        map.register_all(transfer, TTL);
        assert_eq!(map.get("moving"), vec![node("9")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_aborts_timers() {
        let map = LocationMap::new();
        map.register("key", &node("1"), TTL);
        map.clear();
        assert!(map.is_empty());

        tokio::time::advance(TTL * 2).await;
        run_expiries().await;
        assert!(map.is_empty());
    }
}
