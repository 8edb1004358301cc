/*
    WeftClient - third-party access to a running overlay

    Lets an application that is not itself an overlay node connect to any
    running node and store, look up and fetch objects through it. The entry
    node does the routing; blob bytes are fetched directly from whichever
    replica answers.
*/

use tracing::debug;

use crate::config::OverlayConfig;
use crate::core_overlay::{OverlayError, RemoteNode};
use crate::core_rpc::RpcClient;

/// A client attached to one overlay node.
pub struct WeftClient {
    node: RemoteNode,
    rpc: RpcClient,
}

impl WeftClient {
    /// Connect to the overlay node at `addr`.
    pub async fn connect(addr: &str) -> Result<WeftClient, OverlayError> {
        let rpc = RpcClient::new(OverlayConfig::default().rpc_timeout);
        let node = rpc
            .hello(addr, &RemoteNode::empty())
            .await
            .map_err(|e| OverlayError::Transport(format!("failed to reach {}: {}", addr, e)))?;
        debug!(%node, "connected to overlay node");
        Ok(WeftClient { node, rpc })
    }

    /// The node this client is attached to.
    pub fn node(&self) -> &RemoteNode {
        &self.node
    }

    /// Store a (key, bytes) pair through the attached node.
    pub async fn store(&self, key: &str, value: Vec<u8>) -> Result<(), OverlayError> {
        let ok = self
            .rpc
            .store(&self.node, key, value)
            .await
            .map_err(|e| OverlayError::Transport(e.to_string()))?;
        if ok {
            Ok(())
        } else {
            Err(OverlayError::Transport(format!(
                "store of {:?} was rejected by {}",
                key, self.node
            )))
        }
    }

    /// The peers currently advertising `key`.
    pub async fn lookup(&self, key: &str) -> Result<Vec<RemoteNode>, OverlayError> {
        self.rpc
            .lookup(&self.node, key)
            .await
            .map_err(|e| OverlayError::Transport(e.to_string()))
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
}
