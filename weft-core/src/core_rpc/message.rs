/*
    Wire messages - one request/response schema per overlay operation

    Frames are tagged JSON objects. Requests and responses interleave freely
    on a connection and are matched back together by id:

    {"type":"request","id":"...","method":"find_root","params":{...}}
    {"type":"response","id":"...","result":{"Ok":{...}}}

    Peers are carried as NodeMsg: a hex identifier plus host:port. The
    all-zero identifier with an empty address denotes "no peer"; a message
    that fails to parse is treated as if the peer did not exist.
*/

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core_overlay::{NodeId, RemoteNode};

/// A peer on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeMsg {
    pub id: String,
    pub address: String,
}

impl NodeMsg {
    /// The "no peer" value.
    pub fn empty() -> Self {
        NodeMsg {
            id: NodeId::default().to_hex(),
            address: String::new(),
        }
    }

    pub fn from_remote(node: &RemoteNode) -> Self {
        NodeMsg {
            id: node.id.to_hex(),
            address: node.address.clone(),
        }
    }

    /// Parse back into a peer reference. Unparseable or empty messages yield
    /// None.
    pub fn to_remote(&self) -> Option<RemoteNode> {
        let id = NodeId::parse(&self.id).ok()?;
        let node = RemoteNode::new(id, self.address.clone());
        if node.is_empty() {
            None
        } else {
            Some(node)
        }
    }
}

pub fn to_node_msgs(nodes: &[RemoteNode]) -> Vec<NodeMsg> {
    nodes.iter().map(NodeMsg::from_remote).collect()
}

pub fn to_remote_nodes(msgs: &[NodeMsg]) -> Vec<RemoteNode> {
    msgs.iter().filter_map(NodeMsg::to_remote).collect()
}

/// A framed wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    #[serde(rename = "request")]
    Request {
        id: String,
        #[serde(flatten)]
        body: Request,
    },
    #[serde(rename = "response")]
    Response {
        id: String,
        result: Result<Response, WireError>,
    },
}

/// Error payload produced by a remote handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub message: String,
}

impl WireError {
    pub fn new(message: impl Into<String>) -> Self {
        WireError {
            message: message.into(),
        }
    }
}

/// Request payloads, one per operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Hello { joiner: NodeMsg },
    FindRoot { id: String, level: u32 },
    Register { key: String, from: NodeMsg },
    Fetch { key: String },
    AddNode { node: NodeMsg },
    AddNodeMulticast { new_node: NodeMsg, level: u32 },
    Transfer { from: NodeMsg, data: BTreeMap<String, Vec<NodeMsg>> },
    AddBackpointer { from: NodeMsg },
    RemoveBackpointer { from: NodeMsg },
    GetBackpointers { from: NodeMsg, level: u32 },
    NotifyLeave { from: NodeMsg, replacement: NodeMsg },
    RemoveBadNodes { nodes: Vec<NodeMsg> },
    BlobFetch { key: String },
    Lookup { key: String },
    Store { key: String, data: Vec<u8> },
}

/// Response payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Response {
    Node { node: NodeMsg },
    Root { next: NodeMsg, to_remove: Vec<NodeMsg> },
    Ok { ok: bool },
    Locations { values: Vec<NodeMsg>, is_root: bool },
    Neighbors { neighbors: Vec<NodeMsg> },
    Blob { key: String, data: Vec<u8> },
}
