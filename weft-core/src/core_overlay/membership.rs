/*
    Membership - join, acknowledged multicast, and leave

    Joining runs in three phases: route to our own root, announce ourselves
    there to trigger the acknowledged multicast (which returns the merged
    neighbor set), then walk backpointers level by level down to zero to
    fill out the routing table. Leaving notifies every backpointer, handing
    each level a replacement candidate drawn from our own table.
*/

use std::collections::HashSet;

use tracing::{debug, info, warn};

use super::error::OverlayError;
use super::node::WeftNode;
use super::routing_table::RemoteNode;
use super::DIGITS;

impl WeftNode {
    /// Join an existing overlay through `seed`.
    pub async fn join(&self, seed: &RemoteNode) -> Result<(), OverlayError> {
        debug!(%seed, "joining overlay");

        let root = self
            .find_root_on(seed, &self.local.id)
            .await
            .map_err(|e| {
                OverlayError::Transport(format!("failed to route to our root via {}: {}", seed, e))
            })?;

        let neighbors = self.rpc.add_node(&root, &self.local).await.map_err(|e| {
            OverlayError::Transport(format!(
                "failed to announce ourselves to root {}: {}",
                root, e
            ))
        })?;
        for neighbor in &neighbors {
            self.add_route(neighbor).await;
        }

        let start = self.local.id.shared_prefix_length(&seed.id);
        self.traverse_backpointers(neighbors, start).await;
        info!(%seed, "joined overlay");
        Ok(())
    }

    /// Walk backpointers from the initial neighbor frontier down to level 0,
    /// folding everything learned into the routing table and carrying only
    /// the closest peers forward as the next frontier.
    async fn traverse_backpointers(&self, frontier: Vec<RemoteNode>, start_level: usize) {
        let mut frontier = frontier;
        for level in (0..=start_level).rev() {
            let mut next = frontier.clone();
            for neighbor in &frontier {
                match self
                    .rpc
                    .get_backpointers(neighbor, &self.local, level)
                    .await
                {
                    Ok(mut backpointers) => next.append(&mut backpointers),
                    Err(e) => {
                        debug!(%neighbor, error = %e, "backpointer fetch failed during join");
                        self.remove_bad_nodes(std::slice::from_ref(neighbor));
                    }
                }
            }
            dedup_nodes(&mut next);

            for node in &next {
                self.add_route(node).await;
            }

            let local_id = self.local.id;
            next.sort_by(|a, b| local_id.distance(&a.id).cmp(&local_id.distance(&b.id)));
            next.truncate(self.config.neighbor_set_size);
            frontier = next;
        }
    }

    /// Entry point of the acknowledged multicast: a new node has chosen us
    /// as its root. Returns the merged neighbor set.
    pub async fn add_node(&self, new_node: &RemoteNode) -> Vec<RemoteNode> {
        let level = self.local.id.shared_prefix_length(&new_node.id);
        self.add_node_multicast(new_node, level).await
    }

    /// One level of the acknowledged multicast: tell every need-to-know peer
    /// on `level` about `new_node`, fold it into our own table, and hand it
    /// any location entries it now surrogates for.
    pub async fn add_node_multicast(&self, new_node: &RemoteNode, level: usize) -> Vec<RemoteNode> {
        if level >= DIGITS {
            return Vec::new();
        }
        debug!(%new_node, level, "add-node multicast");

        let mut targets = self.table.get_level(level);
        targets.push(self.local.clone());

        let mut results: Vec<RemoteNode> = Vec::new();
        for target in &targets {
            match self.rpc.add_node_multicast(target, new_node, level + 1).await {
                Ok(mut neighbors) => results.append(&mut neighbors),
                Err(e) => {
                    warn!(%target, error = %e, "multicast target unreachable");
                    self.remove_bad_nodes(std::slice::from_ref(target));
                }
            }
        }
        results.extend(targets);

        self.add_route(new_node).await;

        let transfer = self.locations.get_transfer_set(&self.local, new_node);
        if !transfer.is_empty() {
            if let Err(e) = self.rpc.transfer(new_node, &self.local, &transfer).await {
                warn!(%new_node, error = %e, "transfer to joining node failed, restoring entries");
                self.remove_bad_nodes(std::slice::from_ref(new_node));
                self.locations
                    .register_all(transfer, self.config.object_timeout);
            }
        }

        dedup_nodes(&mut results);
        results
    }

    /// Add a peer to the routing table and send the backpointer notices the
    /// mutation implies. Both notices are best effort.
    pub async fn add_route(&self, node: &RemoteNode) {
        let (added, evicted) = self.table.add(node);
        if added {
            if let Err(e) = self.rpc.add_backpointer(node, &self.local).await {
                debug!(%node, error = %e, "backpointer add notice failed");
            }
        }
        if let Some(old) = evicted {
            debug!(node = %old, "displaced from routing table");
            if let Err(e) = self.rpc.remove_backpointer(&old, &self.local).await {
                debug!(node = %old, error = %e, "backpointer remove notice failed");
            }
        }
    }

    /// Handle a peer telling us it now routes through us.
    pub async fn add_backpointer(&self, from: &RemoteNode) {
        if self.backpointers.add(from) {
            debug!(%from, "added backpointer");
        }
        self.add_route(from).await;
    }

    /// Handle a peer telling us it no longer routes through us.
    pub fn remove_backpointer(&self, from: &RemoteNode) {
        if self.backpointers.remove(from) {
            debug!(%from, "removed backpointer");
        }
    }

    /// Snapshot our backpointers at `level` for a traversing joiner.
    pub async fn get_backpointers(&self, from: &RemoteNode, level: usize) -> Vec<RemoteNode> {
        debug!(%from, level, "sending backpointers");
        let backpointers = self.backpointers.get(level);
        self.add_route(from).await;
        backpointers
    }

    /// Evict peers from the routing table and backpointers.
    pub fn remove_bad_nodes(&self, nodes: &[RemoteNode]) {
        for node in nodes {
            if self.table.remove(node) {
                debug!(%node, "evicted from routing table");
            }
            if self.backpointers.remove(node) {
                debug!(%node, "evicted from backpointers");
            }
        }
    }

    /// Gracefully exit the overlay: notify everyone who routes through us,
    /// suggesting a replacement where we have one, then shut down.
    pub async fn leave(&self) {
        info!(node = %self.local, "leaving overlay");

        let mut replacement: Option<RemoteNode> = None;
        for level in (0..DIGITS).rev() {
            for backpointer in self.backpointers.get(level) {
                if let Err(e) = self
                    .rpc
                    .notify_leave(&backpointer, &self.local, replacement.as_ref())
                    .await
                {
                    debug!(node = %backpointer, error = %e, "leave notice failed");
                    self.remove_bad_nodes(std::slice::from_ref(&backpointer));
                }
            }
            replacement = self.table.get_level(level).into_iter().next();
        }

        self.blobs.delete_all();
        self.locations.clear();
        self.rpc.close_all();
        let _ = self.shutdown.send(true);
    }

    /// Handle a peer's graceful-leave notice: drop it everywhere and adopt
    /// the replacement it suggested, if any.
    pub async fn notify_leave(&self, from: &RemoteNode, replacement: Option<RemoteNode>) {
        debug!(%from, "peer left");
        self.table.remove(from);
        self.backpointers.remove(from);
        if let Some(replacement) = replacement {
            self.add_route(&replacement).await;
        }
    }

    /// Tear the node down without notifying anyone. Peers discover the
    /// absence on their next failed call.
    pub fn kill(&self) {
        info!(node = %self.local, "killing node");
        self.blobs.delete_all();
        self.locations.clear();
        self.rpc.close_all();
        let _ = self.shutdown.send(true);
        if let Some(handle) = self
            .server
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
    }
}

/// Drop structural duplicates, keeping first occurrences in order.
fn dedup_nodes(nodes: &mut Vec<RemoteNode>) {
    let mut seen = HashSet::new();
    nodes.retain(|node| seen.insert(node.clone()));
}
