/*
    Server - inbound RPC dispatch

    Workflow:
    - accept connections until the shutdown signal flips
    - per connection: read frames, spawn a handler task per request, and
      funnel responses through a writer task
    - on shutdown the reader stops taking new requests while the writer
      drains the responses of handlers already in flight, then the socket
      closes

    Handlers are thin: they decode the payload and delegate to the node
    orchestrator, which owns all overlay state.
*/

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::core_overlay::node::WeftNode;
use crate::core_overlay::{NodeId, RemoteNode};

use super::message::{to_node_msgs, to_remote_nodes, Frame, NodeMsg, Request, Response, WireError};
use super::transport::{read_frame, write_frame};

/// Accept and serve connections until `shutdown` flips to true.
pub async fn serve(listener: TcpListener, node: Arc<WeftNode>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        trace!(%peer, "accepted connection");
                        tokio::spawn(handle_connection(
                            stream,
                            Arc::clone(&node),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
    debug!("rpc server stopped accepting");
}

async fn handle_connection(
    stream: TcpStream,
    node: Arc<WeftNode>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let (resp_tx, resp_rx) = mpsc::channel::<Frame>(64);
    let writer_task = tokio::spawn(connection_writer(writer, resp_rx));

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut reader) => {
                match frame {
                    Ok(Frame::Request { id, body }) => {
                        let node = Arc::clone(&node);
                        let resp_tx = resp_tx.clone();
                        tokio::spawn(async move {
                            let result = dispatch(&node, body).await;
                            let _ = resp_tx.send(Frame::Response { id, result }).await;
                        });
                    }
                    Ok(Frame::Response { .. }) => {
                        trace!("ignoring response frame on a server connection");
                    }
                    Err(e) => {
                        trace!(error = %e, "connection read ended");
                        break;
                    }
                }
            }
        }
    }

    // Handlers still in flight hold clones of resp_tx; the writer keeps the
    // socket open until the last of them has answered.
    drop(resp_tx);
    let _ = writer_task.await;
}

async fn connection_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            trace!(error = %e, "connection write failed");
            break;
        }
    }
}

async fn dispatch(node: &Arc<WeftNode>, request: Request) -> Result<Response, WireError> {
    match request {
        Request::Hello { joiner } => {
            if let Some(peer) = joiner.to_remote() {
                debug!(%peer, "hello");
            }
            Ok(Response::Node {
                node: NodeMsg::from_remote(node.local()),
            })
        }

        Request::FindRoot { id, level } => {
            let id = NodeId::parse(&id).map_err(|e| WireError::new(e.to_string()))?;
            let (next, to_remove) = node.find_root(&id, level as usize).await;
            Ok(Response::Root {
                next: NodeMsg::from_remote(&next),
                to_remove: to_node_msgs(&to_remove),
            })
        }

        Request::Register { key, from } => {
            let from = parse_peer(&from)?;
            let is_root = node.register(&key, &from).await;
            Ok(Response::Ok { ok: is_root })
        }

        Request::Fetch { key } => {
            let (is_root, values) = node.fetch(&key).await;
            Ok(Response::Locations {
                values: to_node_msgs(&values),
                is_root,
            })
        }

        Request::AddNode { node: joiner } => {
            let joiner = parse_peer(&joiner)?;
            let neighbors = node.add_node(&joiner).await;
            Ok(Response::Neighbors {
                neighbors: to_node_msgs(&neighbors),
            })
        }

        Request::AddNodeMulticast { new_node, level } => {
            let new_node = parse_peer(&new_node)?;
            let neighbors = node.add_node_multicast(&new_node, level as usize).await;
            Ok(Response::Neighbors {
                neighbors: to_node_msgs(&neighbors),
            })
        }

        Request::Transfer { from, data } => {
            let from = parse_peer(&from)?;
            let replica_map: HashMap<String, Vec<RemoteNode>> = data
                .into_iter()
                .map(|(key, nodes)| (key, to_remote_nodes(&nodes)))
                .collect();
            node.transfer(&from, replica_map).await;
            Ok(Response::Ok { ok: true })
        }

        Request::AddBackpointer { from } => {
            let from = parse_peer(&from)?;
            node.add_backpointer(&from).await;
            Ok(Response::Ok { ok: true })
        }

        Request::RemoveBackpointer { from } => {
            let from = parse_peer(&from)?;
            node.remove_backpointer(&from);
            Ok(Response::Ok { ok: true })
        }

        Request::GetBackpointers { from, level } => {
            let from = parse_peer(&from)?;
            let backpointers = node.get_backpointers(&from, level as usize).await;
            Ok(Response::Neighbors {
                neighbors: to_node_msgs(&backpointers),
            })
        }

        Request::NotifyLeave { from, replacement } => {
            let from = parse_peer(&from)?;
            node.notify_leave(&from, replacement.to_remote()).await;
            Ok(Response::Ok { ok: true })
        }

        Request::RemoveBadNodes { nodes } => {
            node.remove_bad_nodes(&to_remote_nodes(&nodes));
            Ok(Response::Ok { ok: true })
        }

        Request::BlobFetch { key } => {
            let data = node
                .blob_fetch_local(&key)
                .map_err(|e| WireError::new(e.to_string()))?;
            Ok(Response::Blob { key, data })
        }

        Request::Lookup { key } => {
            let replicas = node
                .lookup(&key)
                .await
                .map_err(|e| WireError::new(e.to_string()))?;
            Ok(Response::Neighbors {
                neighbors: to_node_msgs(&replicas),
            })
        }

        Request::Store { key, data } => {
            node.store(&key, data)
                .await
                .map_err(|e| WireError::new(e.to_string()))?;
            Ok(Response::Ok { ok: true })
        }
    }
}

fn parse_peer(msg: &NodeMsg) -> Result<RemoteNode, WireError> {
    msg.to_remote()
        .ok_or_else(|| WireError::new(format!("malformed peer message: {:?}", msg)))
}
