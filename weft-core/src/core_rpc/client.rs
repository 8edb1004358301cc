/*
    RpcClient - typed call wrappers over cached connections

    One connection is cached per transport address. Any error on a call
    discards the cached connection so the next call re-dials; the failure is
    then the caller's signal to evict the peer from its routing state.
*/

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::core_overlay::{NodeId, RemoteNode};

use super::error::RpcError;
use super::message::{to_node_msgs, to_remote_nodes, NodeMsg, Request, Response};
use super::transport::Connection;

/// Client side of the RPC surface.
pub struct RpcClient {
    conns: Mutex<HashMap<String, Arc<Connection>>>,
    timeout: Duration,
}

impl RpcClient {
    pub fn new(timeout: Duration) -> Self {
        RpcClient {
            conns: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    fn conns(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.conns.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The cached connection for `addr`, re-dialling if there is none or the
    /// cached one has failed.
    async fn connection(&self, addr: &str) -> Result<Arc<Connection>, RpcError> {
        if let Some(conn) = self.conns().get(addr) {
            if !conn.is_closed() {
                return Ok(Arc::clone(conn));
            }
        }
        let conn = Arc::new(Connection::open(addr).await?);
        self.conns().insert(addr.to_string(), Arc::clone(&conn));
        Ok(conn)
    }

    async fn call(&self, addr: &str, request: Request) -> Result<Response, RpcError> {
        let conn = self.connection(addr).await?;
        match conn.call(request, self.timeout).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.discard(addr);
                Err(e)
            }
        }
    }

    fn discard(&self, addr: &str) {
        self.conns().remove(addr);
    }

    /// Drop every cached connection.
    pub fn close_all(&self) {
        self.conns().clear();
    }

    /// Greet the node at `addr` and learn its identity.
    pub async fn hello(&self, addr: &str, joiner: &RemoteNode) -> Result<RemoteNode, RpcError> {
        let request = Request::Hello {
            joiner: NodeMsg::from_remote(joiner),
        };
        match self.call(addr, request).await? {
            Response::Node { node } => node.to_remote().ok_or(RpcError::Unexpected),
            _ => Err(RpcError::Unexpected),
        }
    }

    /// Ask `remote` for the root of `id`, starting at `level`.
    pub async fn find_root(
        &self,
        remote: &RemoteNode,
        id: &NodeId,
        level: usize,
    ) -> Result<(RemoteNode, Vec<RemoteNode>), RpcError> {
        let request = Request::FindRoot {
            id: id.to_hex(),
            level: level as u32,
        };
        match self.call(&remote.address, request).await? {
            Response::Root { next, to_remove } => {
                let next = next.to_remote().ok_or(RpcError::Unexpected)?;
                Ok((next, to_remote_nodes(&to_remove)))
            }
            _ => Err(RpcError::Unexpected),
        }
    }

    /// Register `from` as an advertiser of `key` on `remote`. Returns the
    /// remote's is-root verdict.
    pub async fn register(
        &self,
        remote: &RemoteNode,
        key: &str,
        from: &RemoteNode,
    ) -> Result<bool, RpcError> {
        let request = Request::Register {
            key: key.to_string(),
            from: NodeMsg::from_remote(from),
        };
        self.expect_ok(&remote.address, request).await
    }

    /// Fetch the advertisers of `key` from `remote`, with its is-root
    /// verdict.
    pub async fn fetch(
        &self,
        remote: &RemoteNode,
        key: &str,
    ) -> Result<(Vec<RemoteNode>, bool), RpcError> {
        let request = Request::Fetch {
            key: key.to_string(),
        };
        match self.call(&remote.address, request).await? {
            Response::Locations { values, is_root } => Ok((to_remote_nodes(&values), is_root)),
            _ => Err(RpcError::Unexpected),
        }
    }

    /// Announce a joining node to its root, triggering the acknowledged
    /// multicast. Returns the merged neighbor set.
    pub async fn add_node(
        &self,
        remote: &RemoteNode,
        new_node: &RemoteNode,
    ) -> Result<Vec<RemoteNode>, RpcError> {
        let request = Request::AddNode {
            node: NodeMsg::from_remote(new_node),
        };
        self.expect_neighbors(&remote.address, request).await
    }

    /// Propagate one level of the acknowledged multicast to `remote`.
    pub async fn add_node_multicast(
        &self,
        remote: &RemoteNode,
        new_node: &RemoteNode,
        level: usize,
    ) -> Result<Vec<RemoteNode>, RpcError> {
        let request = Request::AddNodeMulticast {
            new_node: NodeMsg::from_remote(new_node),
            level: level as u32,
        };
        self.expect_neighbors(&remote.address, request).await
    }

    /// Hand a map of location entries to their new root.
    pub async fn transfer(
        &self,
        remote: &RemoteNode,
        from: &RemoteNode,
        data: &HashMap<String, Vec<RemoteNode>>,
    ) -> Result<bool, RpcError> {
        let data: BTreeMap<String, Vec<NodeMsg>> = data
            .iter()
            .map(|(key, nodes)| (key.clone(), to_node_msgs(nodes)))
            .collect();
        let request = Request::Transfer {
            from: NodeMsg::from_remote(from),
            data,
        };
        self.expect_ok(&remote.address, request).await
    }

    /// Tell `remote` that `from` now routes through it.
    pub async fn add_backpointer(
        &self,
        remote: &RemoteNode,
        from: &RemoteNode,
    ) -> Result<bool, RpcError> {
        let request = Request::AddBackpointer {
            from: NodeMsg::from_remote(from),
        };
        self.expect_ok(&remote.address, request).await
    }

    /// Tell `remote` that `from` no longer routes through it.
    pub async fn remove_backpointer(
        &self,
        remote: &RemoteNode,
        from: &RemoteNode,
    ) -> Result<bool, RpcError> {
        let request = Request::RemoveBackpointer {
            from: NodeMsg::from_remote(from),
        };
        self.expect_ok(&remote.address, request).await
    }

    /// Fetch the backpointers of `remote` at `level`.
    pub async fn get_backpointers(
        &self,
        remote: &RemoteNode,
        from: &RemoteNode,
        level: usize,
    ) -> Result<Vec<RemoteNode>, RpcError> {
        let request = Request::GetBackpointers {
            from: NodeMsg::from_remote(from),
            level: level as u32,
        };
        self.expect_neighbors(&remote.address, request).await
    }

    /// Notify `remote` of our graceful leave, suggesting `replacement` when
    /// we have one.
    pub async fn notify_leave(
        &self,
        remote: &RemoteNode,
        from: &RemoteNode,
        replacement: Option<&RemoteNode>,
    ) -> Result<bool, RpcError> {
        let request = Request::NotifyLeave {
            from: NodeMsg::from_remote(from),
            replacement: replacement.map(NodeMsg::from_remote).unwrap_or_else(NodeMsg::empty),
        };
        self.expect_ok(&remote.address, request).await
    }

    /// Ask `remote` to evict the given peers.
    pub async fn remove_bad_nodes(
        &self,
        remote: &RemoteNode,
        nodes: &[RemoteNode],
    ) -> Result<bool, RpcError> {
        let request = Request::RemoveBadNodes {
            nodes: to_node_msgs(nodes),
        };
        self.expect_ok(&remote.address, request).await
    }

    /// Fetch the raw blob for `key` from `remote`'s local store.
    pub async fn blob_fetch(&self, remote: &RemoteNode, key: &str) -> Result<Vec<u8>, RpcError> {
        let request = Request::BlobFetch {
            key: key.to_string(),
        };
        match self.call(&remote.address, request).await? {
            Response::Blob { data, .. } => Ok(data),
            _ => Err(RpcError::Unexpected),
        }
    }

    /// Run a full overlay lookup on `remote`.
    pub async fn lookup(&self, remote: &RemoteNode, key: &str) -> Result<Vec<RemoteNode>, RpcError> {
        let request = Request::Lookup {
            key: key.to_string(),
        };
        self.expect_neighbors(&remote.address, request).await
    }

    /// Run a full store-and-publish on `remote`.
    pub async fn store(
        &self,
        remote: &RemoteNode,
        key: &str,
        data: Vec<u8>,
    ) -> Result<bool, RpcError> {
        let request = Request::Store {
            key: key.to_string(),
            data,
        };
        self.expect_ok(&remote.address, request).await
    }

    async fn expect_ok(&self, addr: &str, request: Request) -> Result<bool, RpcError> {
        match self.call(addr, request).await? {
            Response::Ok { ok } => Ok(ok),
            _ => Err(RpcError::Unexpected),
        }
    }

    async fn expect_neighbors(
        &self,
        addr: &str,
        request: Request,
    ) -> Result<Vec<RemoteNode>, RpcError> {
        match self.call(addr, request).await? {
            Response::Neighbors { neighbors } => Ok(to_remote_nodes(&neighbors)),
            _ => Err(RpcError::Unexpected),
        }
    }
}
