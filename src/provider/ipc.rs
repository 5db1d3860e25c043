//! IPC transport: EIP-1193 over a Unix domain socket.
//!
//! The wallet listens on a socket and speaks newline-delimited
//! JSON-RPC 2.0 (see [`super::codec`]). One background task owns the
//! framed socket and:
//! 1. Writes outbound requests and remembers their ids.
//! 2. Routes responses back to the waiting caller by id.
//! 3. Turns `accountsChanged` / `chainChanged` / `disconnect`
//!    notifications into [`ProviderEvent`]s on a broadcast channel.
//! 4. On EOF, error, or close, fails every pending request and emits a
//!    final `Disconnect` event.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use super::codec::{CodecError, DecodeResult, LineCodec, RpcRequest, decode_frame};
use super::{Eip1193, ProviderEvent, RequestArguments};
use crate::error::ProviderRpcError;

const EVENT_CAPACITY: usize = 64;

type Reply = oneshot::Sender<Result<Value, ProviderRpcError>>;

/// A request handed from [`IpcProvider::request`] to the transport task.
#[derive(Debug)]
struct Outbound {
    method: String,
    params: Value,
    reply: Reply,
}

/// EIP-1193 provider backed by a Unix socket.
#[derive(Debug)]
pub struct IpcProvider {
    cmd_tx: mpsc::UnboundedSender<Outbound>,
    events: broadcast::Sender<ProviderEvent>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
    /// Whether this transport carries a remote session whose liveness
    /// callers may ask about.
    tracks_session: bool,
}

impl IpcProvider {
    /// Connect to a wallet socket and spawn the transport task.
    pub async fn connect(path: &Path) -> std::io::Result<Self> {
        let stream = UnixStream::connect(path).await?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let open = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        spawn_transport(
            stream,
            path.to_path_buf(),
            cmd_rx,
            events.clone(),
            Arc::clone(&open),
            cancel.clone(),
        );

        tracing::debug!(path = %path.display(), "ipc provider connected");

        Ok(Self {
            cmd_tx,
            events,
            open,
            cancel,
            tracks_session: false,
        })
    }

    /// Report the transport's liveness through [`Eip1193::session_alive`].
    /// Used for remote wallet bridges, where the open socket is the
    /// session.
    pub fn with_session_tracking(mut self) -> Self {
        self.tracks_session = true;
        self
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl Drop for IpcProvider {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Eip1193 for IpcProvider {
    fn request(&self, args: RequestArguments) -> BoxFuture<'_, Result<Value, ProviderRpcError>> {
        Box::pin(async move {
            let (reply, rx) = oneshot::channel();
            self.cmd_tx
                .send(Outbound {
                    method: args.method,
                    params: args.params,
                    reply,
                })
                .map_err(|_| ProviderRpcError::disconnected("ipc transport closed"))?;
            rx.await
                .map_err(|_| ProviderRpcError::disconnected("ipc transport dropped request"))?
        })
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ProviderEvent>> {
        Some(self.events.subscribe())
    }

    fn session_alive(&self) -> Option<bool> {
        self.tracks_session.then(|| self.is_open())
    }

    fn close(&self) -> BoxFuture<'_, Result<(), ProviderRpcError>> {
        Box::pin(async move {
            self.cancel.cancel();
            Ok(())
        })
    }
}

fn spawn_transport(
    stream: UnixStream,
    path: PathBuf,
    mut cmd_rx: mpsc::UnboundedReceiver<Outbound>,
    events: broadcast::Sender<ProviderEvent>,
    open: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut pending: HashMap<u64, Reply> = HashMap::new();
        let result = run_transport(stream, &mut cmd_rx, &events, &cancel, &mut pending).await;
        open.store(false, Ordering::Release);

        let reason = match &result {
            Ok(()) => "ipc transport closed".to_string(),
            Err(e) => format!("ipc transport failed: {e}"),
        };
        tracing::debug!(path = %path.display(), %reason, pending = pending.len(), "ipc transport stopped");

        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(ProviderRpcError::disconnected(reason.clone())));
        }
        // Requests queued after the socket died.
        cmd_rx.close();
        while let Ok(out) = cmd_rx.try_recv() {
            let _ = out
                .reply
                .send(Err(ProviderRpcError::disconnected(reason.clone())));
        }
        let _ = events.send(ProviderEvent::Disconnect(ProviderRpcError::disconnected(
            reason,
        )));
    });
}

async fn run_transport(
    stream: UnixStream,
    cmd_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    events: &broadcast::Sender<ProviderEvent>,
    cancel: &CancellationToken,
    pending: &mut HashMap<u64, Reply>,
) -> Result<(), CodecError> {
    let mut framed = Framed::new(stream, LineCodec::new());
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),

            cmd = cmd_rx.recv() => {
                let Some(out) = cmd else {
                    // Provider dropped.
                    return Ok(());
                };
                let id = next_id;
                next_id += 1;
                pending.insert(id, out.reply);
                framed.send(RpcRequest::new(id, out.method, out.params)).await?;
            }

            frame = framed.next() => {
                let line = match frame {
                    Some(Ok(line)) => line,
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                };
                match decode_frame(&line) {
                    DecodeResult::Response { id, result } => match pending.remove(&id) {
                        Some(reply) => {
                            let _ = reply.send(result);
                        }
                        None => tracing::warn!(id, "response for unknown request id"),
                    },
                    DecodeResult::Notification { method, params } => {
                        match ProviderEvent::from_notification(&method, &params) {
                            Some(event) => {
                                let _ = events.send(event);
                            }
                            None => tracing::debug!(%method, "ignoring notification"),
                        }
                    }
                    DecodeResult::Malformed(reason) => {
                        tracing::warn!(%reason, "skipping malformed frame");
                    }
                }
            }
        }
    }
}
