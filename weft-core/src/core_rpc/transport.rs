/*
    Transport - framed, multiplexed RPC connections

    Frames are u32-length-prefixed JSON. A Connection owns one TCP stream
    through a writer task and a reader task; concurrent calls interleave on
    the socket and are matched back to their callers by request id through a
    pending map. Each pending call holds its oneshot sender plus the abort
    handle of a spawned timeout task; whichever of response, deadline or
    connection failure comes first resolves the call and cancels the rest.
    Loopback calls to the local node during join and multicast nest on the
    same connection, so several requests can be in flight at once.

    A connection that sees any read, write or deadline failure marks itself
    closed and fails every pending call; the owner re-dials on next use.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::trace;
use uuid::Uuid;

use super::error::RpcError;
use super::message::{Frame, Request, Response};

/// Frames larger than this are rejected before decoding.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Read one frame from the stream.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, RpcError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await? as usize;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::Codec(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_SIZE
        )));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| RpcError::Codec(e.to_string()))
}

/// Write one frame to the stream.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let buf = serde_json::to_vec(frame).map_err(|e| RpcError::Codec(e.to_string()))?;
    if buf.len() > MAX_FRAME_SIZE {
        return Err(RpcError::Codec(format!(
            "frame of {} bytes exceeds the {} byte limit",
            buf.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u32(buf.len() as u32).await?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// A call awaiting its response, with the timeout task that fails it if the
/// deadline passes first.
struct PendingCall {
    response_tx: oneshot::Sender<Result<Response, RpcError>>,
    timeout: AbortHandle,
}

type Pending = Mutex<HashMap<String, PendingCall>>;

/// One multiplexed client connection to a peer.
pub struct Connection {
    write_tx: mpsc::Sender<Frame>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Dial `addr` and spawn the connection's reader and writer tasks.
    pub async fn open(addr: &str) -> Result<Connection, RpcError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| RpcError::Dial {
                addr: addr.to_string(),
                source,
            })?;
        let (read_half, write_half) = stream.into_split();
        let pending: Arc<Pending> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (write_tx, write_rx) = mpsc::channel(64);

        tokio::spawn(write_loop(
            write_half,
            write_rx,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));
        tokio::spawn(read_loop(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Ok(Connection {
            write_tx,
            pending,
            closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Issue one unary call with the given deadline.
    pub async fn call(&self, request: Request, deadline: Duration) -> Result<Response, RpcError> {
        let id = Uuid::new_v4().to_string();
        let (response_tx, response_rx) = oneshot::channel();

        // The timeout task only fires if the call is still pending when the
        // deadline passes; a missed deadline also poisons the connection so
        // the owner re-dials on next use.
        let timeout_task = tokio::spawn({
            let pending = Arc::clone(&self.pending);
            let closed = Arc::clone(&self.closed);
            let id = id.clone();
            async move {
                tokio::time::sleep(deadline).await;
                let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                if let Some(call) = waiter {
                    closed.store(true, Ordering::SeqCst);
                    let _ = call.response_tx.send(Err(RpcError::Timeout));
                }
            }
        });

        self.pending_map().insert(
            id.clone(),
            PendingCall {
                response_tx,
                timeout: timeout_task.abort_handle(),
            },
        );

        let frame = Frame::Request {
            id: id.clone(),
            body: request,
        };
        if self.write_tx.send(frame).await.is_err() {
            if let Some(call) = self.pending_map().remove(&id) {
                call.timeout.abort();
            }
            return Err(RpcError::Closed);
        }

        match response_rx.await {
            Ok(result) => result,
            Err(_) => Err(RpcError::Closed),
        }
    }

    fn pending_map(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingCall>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            trace!(error = %e, "connection write failed");
            break;
        }
    }
    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending);
}

async fn read_loop(mut reader: OwnedReadHalf, pending: Arc<Pending>, closed: Arc<AtomicBool>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Frame::Response { id, result }) => {
                let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
                if let Some(call) = waiter {
                    call.timeout.abort();
                    let _ = call
                        .response_tx
                        .send(result.map_err(|e| RpcError::Remote(e.message)));
                }
            }
            Ok(Frame::Request { .. }) => {
                trace!("ignoring request frame on a client connection");
            }
            Err(e) => {
                trace!(error = %e, "connection read ended");
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending);
}

fn fail_pending(pending: &Pending) {
    let waiters: Vec<_> = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .collect();
    for (_, call) in waiters {
        call.timeout.abort();
        let _ = call.response_tx.send(Err(RpcError::Closed));
    }
}
