//! JSON-RPC stdio transport with id→waiter correlation.
//!
//! One writer task owns the child's stdin (writes are serialized at message
//! boundaries), one reader task parses newline-delimited JSON from stdout
//! and routes responses to the waiter registered under their id. Inbound
//! notifications are forwarded to the subscriber channel handed out at
//! construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{InboundMessage, JsonRpcNotification, JsonRpcRequest, ServerNotification};

/// Maximum accepted line length. Sized for large tool outputs (file reads,
/// search results); anything longer is dropped.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

type Waiter = oneshot::Sender<Result<Value>>;
type PendingTable = Arc<Mutex<HashMap<i64, Waiter>>>;

/// A live transport over one child process's stdin/stdout.
#[derive(Debug)]
pub struct Transport {
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingTable,
    next_id: AtomicI64,
    closed: CancellationToken,
}

impl Transport {
    /// Wrap an already-opened stdin/stdout pair.
    ///
    /// Returns the transport and the receiver on which inbound
    /// notifications are delivered.
    pub fn new<W, R>(stdin: W, stdout: R) -> (Self, mpsc::UnboundedReceiver<ServerNotification>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        tokio::spawn(write_loop(
            stdin,
            outbound_rx,
            pending.clone(),
            closed.clone(),
        ));
        tokio::spawn(read_loop(stdout, pending.clone(), closed.clone(), notify_tx));

        let transport = Self {
            outbound,
            pending,
            next_id: AtomicI64::new(1),
            closed,
        };
        (transport, notify_rx)
    }

    /// Send a request and wait for the matching response.
    ///
    /// Fails with [`Error::Timeout`] if no response arrives by the deadline
    /// (the pending entry is removed; a late response is discarded), or with
    /// [`Error::TransportClosed`] if the transport dies while waiting.
    pub async fn call(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<Value> {
        if self.closed.is_cancelled() {
            return Err(Error::TransportClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.outbound.send(line).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(Error::TransportClosed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            // Waiter dropped without a verdict: the transport tore down
            // between registration and delivery.
            Ok(Err(_)) => Err(Error::TransportClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(Error::Timeout)
            }
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::TransportClosed);
        }
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.outbound
            .send(line)
            .map_err(|_| Error::TransportClosed)
    }

    /// Tear down the transport: fail all pending calls with
    /// `transport closed` and release stdin so the child sees EOF.
    pub async fn close(&self) {
        self.closed.cancel();
        fail_pending(&self.pending).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves when the transport dies (EOF, write error, or close).
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }
}

async fn write_loop<W>(
    mut stdin: W,
    mut outbound: mpsc::UnboundedReceiver<String>,
    pending: PendingTable,
    closed: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(line) => {
                    let write = async {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.write_all(b"\n").await?;
                        stdin.flush().await
                    };
                    if let Err(e) = write.await {
                        debug!("stdin write failed: {e}");
                        break;
                    }
                }
                None => break,
            },
            _ = closed.cancelled() => break,
        }
    }
    closed.cancel();
    fail_pending(&pending).await;
    // stdin is dropped here, delivering EOF to the child.
}

async fn read_loop<R>(
    stdout: R,
    pending: PendingTable,
    closed: CancellationToken,
    notify_tx: mpsc::UnboundedSender<ServerNotification>,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let next = tokio::select! {
            line = lines.next_line() => line,
            _ = closed.cancelled() => break,
        };
        match next {
            Ok(Some(line)) => handle_line(&line, &pending, &notify_tx).await,
            Ok(None) => {
                debug!("stdout EOF");
                break;
            }
            Err(e) => {
                debug!("stdout read failed: {e}");
                break;
            }
        }
    }
    closed.cancel();
    fail_pending(&pending).await;
}

async fn handle_line(
    line: &str,
    pending: &PendingTable,
    notify_tx: &mpsc::UnboundedSender<ServerNotification>,
) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if line.len() > MAX_LINE_BYTES {
        warn!(bytes = line.len(), "dropping oversized message");
        return;
    }

    let msg: InboundMessage = match serde_json::from_str(line) {
        Ok(msg) => msg,
        Err(e) => {
            // Malformed lines do not tear down the transport.
            warn!("skipping malformed message: {e}");
            return;
        }
    };

    if let Some(id) = msg.response_id() {
        let waiter = pending.lock().await.remove(&id);
        match waiter {
            Some(tx) => {
                let outcome = match msg.error {
                    Some(err) => Err(Error::Server(err)),
                    None => Ok(msg.result.unwrap_or(Value::Null)),
                };
                // A cancelled caller has already dropped its receiver.
                let _ = tx.send(outcome);
            }
            None => warn!(id, "dropping response for unknown request id"),
        }
    } else if msg.is_notification() {
        let method = msg.method.unwrap_or_default();
        let _ = notify_tx.send(ServerNotification {
            method,
            params: msg.params,
        });
    } else {
        warn!("skipping message that is neither response nor notification");
    }
}

async fn fail_pending(pending: &PendingTable) {
    let mut table = pending.lock().await;
    for (_, waiter) in table.drain() {
        let _ = waiter.send(Err(Error::TransportClosed));
    }
}
