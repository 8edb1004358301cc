/*
    WeftNode - the overlay participant

    Responsibilities:
    `node.rs` is the brain of one overlay node. A WeftNode instance:
    - owns the local identity, routing table, backpointers, location map and
      blob store
    - serves the RPC surface (dispatch lives in core_rpc::server)
    - exposes the user-facing operations: store(key, bytes), get(key),
      remove(key)
    - runs publishing: an initial registration at the key's root plus a
      background republish loop per stored key
    - resolves roots with the iterative find-root walk, evicting unreachable
      hops as it goes

    Join, multicast, backpointer exchange and leave live in membership.rs.

    Inputs:
    - user calls from the shell or the client API
    - decoded RPC requests from remote peers
    - republish ticks and location expiry timers

    Outputs:
    - RPC calls to remote peers
    - routing table / backpointer / location map mutations
    - logs for monitoring and debugging
*/

use std::sync::{Arc, Mutex, Weak};

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::OverlayConfig;
use crate::core_rpc::client::RpcClient;
use crate::core_rpc::error::RpcError;
use crate::core_rpc::server;
use crate::core_store::BlobStore;

use super::backpointers::Backpointers;
use super::error::OverlayError;
use super::location_map::LocationMap;
use super::node_id::NodeId;
use super::routing_table::{RemoteNode, RoutingTable};
use super::DIGITS;

/// One overlay node: identity, routing state, location index, blob store
/// and the client side of the RPC surface.
pub struct WeftNode {
    pub(super) local: RemoteNode,
    pub(super) config: OverlayConfig,
    pub(super) table: RoutingTable,
    pub(super) backpointers: Backpointers,
    pub(super) locations: LocationMap,
    pub(super) blobs: BlobStore,
    pub(super) rpc: RpcClient,
    pub(super) shutdown: watch::Sender<bool>,
    pub(super) server: Mutex<Option<JoinHandle<()>>>,
    // Handle back to our own Arc, set at startup; publish loops clone it.
    self_ref: Mutex<Weak<WeftNode>>,
}

impl WeftNode {
    /// Start a node with a random identifier.
    pub async fn start(config: OverlayConfig) -> Result<Arc<WeftNode>, OverlayError> {
        Self::start_with_id(NodeId::random(), config).await
    }

    /// Start a node with the given identifier: bind the listener, serve the
    /// RPC surface, and join through the configured seed if one is set.
    pub async fn start_with_id(
        id: NodeId,
        config: OverlayConfig,
    ) -> Result<Arc<WeftNode>, OverlayError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| {
                OverlayError::Transport(format!(
                    "failed to bind {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;
        let address = listener
            .local_addr()
            .map_err(|e| OverlayError::Transport(format!("failed to read bound address: {}", e)))?
            .to_string();

        let local = RemoteNode::new(id, address);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let node = Arc::new(WeftNode {
            table: RoutingTable::new(local.clone()),
            backpointers: Backpointers::new(local.clone()),
            locations: LocationMap::new(),
            blobs: BlobStore::new(),
            rpc: RpcClient::new(config.rpc_timeout),
            local,
            config,
            shutdown,
            server: Mutex::new(None),
            self_ref: Mutex::new(Weak::new()),
        });
        *node.self_ref.lock().unwrap_or_else(|e| e.into_inner()) = Arc::downgrade(&node);

        let handle = tokio::spawn(server::serve(listener, Arc::clone(&node), shutdown_rx));
        *node.server.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        info!(node = %node.local, "node started");

        if let Some(seed) = node.config.seed.clone() {
            let seed_node = match node.rpc.hello(&seed, &node.local).await {
                Ok(seed_node) => seed_node,
                Err(e) => {
                    node.kill();
                    return Err(OverlayError::Transport(format!(
                        "failed to reach seed {}: {}",
                        seed, e
                    )));
                }
            };
            if let Err(e) = node.join(&seed_node).await {
                node.kill();
                return Err(e);
            }
        }

        Ok(node)
    }

    pub fn local(&self) -> &RemoteNode {
        &self.local
    }

    pub fn id(&self) -> &NodeId {
        &self.local.id
    }

    pub fn address(&self) -> &str {
        &self.local.address
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Store bytes locally and advertise the key to the overlay.
    pub async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), OverlayError> {
        let cancel = self.publish(key).await?;
        self.blobs.put(key, value, cancel);
        Ok(())
    }

    /// Look up `key` and fetch its bytes from one of the advertisers.
    pub async fn get(&self, key: &str) -> Result<Vec<u8>, OverlayError> {
        let replicas = self.lookup(key).await?;
        if replicas.is_empty() {
            return Err(OverlayError::NoReplicas {
                key: key.to_string(),
            });
        }

        let mut failures = Vec::new();
        for replica in &replicas {
            match self.rpc.blob_fetch(replica, key).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    debug!(%replica, error = %e, "replica fetch failed");
                    failures.push(format!("{}: {}", replica, e));
                }
            }
        }
        Err(OverlayError::Transport(format!(
            "no advertiser of {:?} answered: [{}]",
            key,
            failures.join("; ")
        )))
    }

    /// Drop the local blob for `key` and stop advertising it. The root's
    /// location entry then ages out on its own.
    pub fn remove(&self, key: &str) -> bool {
        self.blobs.delete(key)
    }

    /// Serve a direct fetch from the local blob store.
    pub fn blob_fetch_local(&self, key: &str) -> Result<Vec<u8>, OverlayError> {
        self.blobs.get(key).ok_or_else(|| OverlayError::NotFound {
            key: key.to_string(),
        })
    }

    /// Advertise `key` now, then keep republishing on the configured
    /// interval until the returned cancel sender fires (or is dropped).
    pub async fn publish(&self, key: &str) -> Result<mpsc::Sender<()>, OverlayError> {
        self.attempt_publish(key).await?;

        let node = self
            .self_ref
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .upgrade()
            .ok_or_else(|| OverlayError::Transport("node is shutting down".to_string()))?;
        let (cancel_tx, mut cancel_rx) = mpsc::channel(1);
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(node.config.republish_interval) => {
                        if let Err(e) = node.attempt_publish(&key).await {
                            warn!(key = %key, error = %e, "republish failed");
                        }
                    }
                    _ = cancel_rx.recv() => {
                        debug!(key = %key, "publish loop cancelled");
                        break;
                    }
                }
            }
        });

        Ok(cancel_tx)
    }

    /// One full publish attempt: resolve the key's root and register there,
    /// retrying up to the configured budget.
    pub(super) async fn attempt_publish(&self, key: &str) -> Result<(), OverlayError> {
        let id = NodeId::hash(key);
        let mut last = OverlayError::Transport(format!("publish of {:?} made no attempts", key));

        for _ in 0..self.config.retries {
            // Route from ourselves over RPC so each failure repairs the
            // local table through the usual eviction path.
            let root = match self.find_root_on(&self.local, &id).await {
                Ok(root) => root,
                Err(e) => {
                    last = OverlayError::Transport(e.to_string());
                    continue;
                }
            };
            match self.rpc.register(&root, key, &self.local).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!(key = %key, root = %root, "registration bounced off a non-root");
                    last = OverlayError::NotRoot {
                        key: key.to_string(),
                    };
                }
                Err(e) => {
                    self.remove_bad_nodes(std::slice::from_ref(&root));
                    last = OverlayError::Transport(e.to_string());
                }
            }
        }
        Err(last)
    }

    /// Resolve the advertisers of `key` from its root, retrying up to the
    /// configured budget. A response with `is_root == false` counts as a
    /// retryable failure; a root's answer is final even when it is empty.
    pub async fn lookup(&self, key: &str) -> Result<Vec<RemoteNode>, OverlayError> {
        let id = NodeId::hash(key);
        let mut last = OverlayError::Transport(format!("lookup of {:?} made no attempts", key));

        for _ in 0..self.config.retries {
            let root = match self.find_root_on(&self.local, &id).await {
                Ok(root) => root,
                Err(e) => {
                    last = OverlayError::Transport(e.to_string());
                    continue;
                }
            };
            match self.rpc.fetch(&root, key).await {
                Ok((values, true)) => return Ok(values),
                Ok((_, false)) => {
                    last = OverlayError::NotRoot {
                        key: key.to_string(),
                    };
                }
                Err(e) => {
                    self.remove_bad_nodes(std::slice::from_ref(&root));
                    last = OverlayError::Transport(e.to_string());
                }
            }
        }
        Err(last)
    }

    /// Ask `start` to resolve the root for `id` over RPC.
    pub async fn find_root_on(
        &self,
        start: &RemoteNode,
        id: &NodeId,
    ) -> Result<RemoteNode, RpcError> {
        let (root, _) = self.rpc.find_root(start, id, 0).await?;
        Ok(root)
    }

    /// Walk the routing fabric toward the surrogate root for `id`.
    ///
    /// Unreachable hops are evicted locally, accumulated for the caller, and
    /// the walk resumes at the same level; every failure strictly shrinks
    /// the routing table, which bounds the loop.
    pub async fn find_root(&self, id: &NodeId, start_level: usize) -> (RemoteNode, Vec<RemoteNode>) {
        let mut bad_nodes: Vec<RemoteNode> = Vec::new();
        let mut level = start_level;

        loop {
            if level >= DIGITS {
                return (self.local.clone(), bad_nodes);
            }

            let next = self.table.find_next_hop(id, level);
            if next.id == self.local.id {
                level += 1;
                continue;
            }

            match self.rpc.find_root(&next, id, level + 1).await {
                Ok((root, to_remove)) => {
                    for node in to_remove {
                        if !bad_nodes.contains(&node) {
                            bad_nodes.push(node);
                        }
                    }
                    self.remove_bad_nodes(&bad_nodes);
                    return (root, bad_nodes);
                }
                Err(e) => {
                    debug!(hop = %next, error = %e, "next hop unreachable during find-root");
                    self.remove_bad_nodes(std::slice::from_ref(&next));
                    if !bad_nodes.contains(&next) {
                        bad_nodes.push(next);
                    }
                }
            }
        }
    }

    /// Handle a replica registering as an advertiser of `key`. Registers
    /// only if we are the key's root; the verdict goes back to the caller.
    pub async fn register(&self, key: &str, replica: &RemoteNode) -> bool {
        let (root, _) = self.find_root(&NodeId::hash(key), 0).await;
        if root.id != self.local.id {
            return false;
        }
        if self
            .locations
            .register(key, replica, self.config.object_timeout)
        {
            debug!(key = %key, %replica, "new advertiser registered");
        }
        true
    }

    /// Handle a fetch for `key`: the advertiser snapshot plus our is-root
    /// verdict.
    pub async fn fetch(&self, key: &str) -> (bool, Vec<RemoteNode>) {
        let (root, _) = self.find_root(&NodeId::hash(key), 0).await;
        if root.id != self.local.id {
            return (false, Vec::new());
        }
        (true, self.locations.get(key))
    }

    /// Accept a hand-off of location entries from a previous root.
    pub async fn transfer(
        &self,
        from: &RemoteNode,
        replica_map: std::collections::HashMap<String, Vec<RemoteNode>>,
    ) {
        if !replica_map.is_empty() {
            debug!(%from, keys = replica_map.len(), "accepting location transfer");
            self.locations
                .register_all(replica_map, self.config.object_timeout);
        }
        self.add_route(from).await;
    }

    /// Rendering of the routing table for the shell.
    pub fn routing_table_dump(&self) -> String {
        self.table.dump()
    }

    /// Rendering of the backpointer sets for the shell.
    pub fn backpointers_dump(&self) -> String {
        self.backpointers.dump()
    }

    /// Rendering of the location map for the shell.
    pub fn locations_dump(&self) -> String {
        self.locations.dump()
    }

    /// Keys of the locally stored blobs.
    pub fn blob_keys(&self) -> Vec<String> {
        self.blobs.keys()
    }
}
