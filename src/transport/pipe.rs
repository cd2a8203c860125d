// SPDX-License-Identifier: MIT
//! Shared JSON-RPC-over-pipe machinery for the process, remote-shell and
//! container clients.
//!
//! Frames are newline-delimited JSON objects. A single writer lock
//! serializes outbound frames; outbound ids come from a monotonically
//! increasing counter. Before a request frame is written, a oneshot
//! completion channel is parked in the pending map under its id. One reader
//! task per client consumes lines from the southbound stream and routes
//! replies to their completion channels. When the reader exits — EOF, read
//! error, or cancellation — it drains the pending map, completing every
//! outstanding request with a synthetic `connection lost` error so callers
//! never sit out the request timeout against a dead peer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TransportError;
use crate::jsonrpc::{Request, Response};
use crate::mcp::{self, InitializeResult, Tool, ToolsListResult};

type PendingReply = Result<Response, TransportError>;
type PendingMap = HashMap<i64, oneshot::Sender<PendingReply>>;

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// The pipe RPC core owned by each pipe-style client.
pub struct PipeRpc {
    name: String,
    next_id: AtomicI64,
    request_timeout: Duration,
    writer: Mutex<Option<BoxWriter>>,
    pending: Arc<StdMutex<PendingMap>>,
    reader_cancel: StdMutex<Option<CancellationToken>>,
}

impl PipeRpc {
    pub fn new(name: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            next_id: AtomicI64::new(1),
            request_timeout,
            writer: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            reader_cancel: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Take ownership of the stream halves and start the reader task.
    /// Returns the reader's cancellation token so the owning client can hang
    /// auxiliary tasks (stderr logging) off child tokens.
    pub async fn attach<W, R>(&self, writer: W, reader: R) -> CancellationToken
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let token = CancellationToken::new();
        *self.writer.lock().await = Some(Box::new(writer));
        *self.reader_cancel.lock().expect("reader_cancel poisoned") = Some(token.clone());

        let name = self.name.clone();
        let pending = Arc::clone(&self.pending);
        let reader_token = token.clone();
        tokio::spawn(async move {
            read_loop(name, pending, reader, reader_token).await;
        });
        token
    }

    /// Stop the reader and drop the writer. The exiting reader drains the
    /// pending map. Idempotent.
    pub async fn detach(&self) {
        let token = self
            .reader_cancel
            .lock()
            .expect("reader_cancel poisoned")
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        *self.writer.lock().await = None;
    }

    pub async fn is_attached(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    /// Write one frame. The writer mutex is never held across a read wait.
    async fn send(&self, frame: &impl serde::Serialize) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(frame)
            .map_err(|e| TransportError::Protocol(format!("encoding frame: {e}")))?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(TransportError::NotConnected)?;
        writer.write_all(&line).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a notification — no id, no pending entry, no reply.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.send(&Request::notification(method, params)).await
    }

    /// One JSON-RPC round trip. The winner of completion / deadline /
    /// cancellation decides the outcome; a loss by the reply removes the
    /// pending entry so a late reply is dropped silently.
    pub async fn call(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending map poisoned")
            .insert(id, tx);

        if let Err(e) = self.send(&Request::new(id, method, params)).await {
            self.remove_pending(id);
            return Err(e);
        }

        tokio::select! {
            reply = rx => match reply {
                Ok(Ok(resp)) => {
                    if let Some(err) = resp.error {
                        Err(TransportError::Rpc(err))
                    } else {
                        Ok(resp.result.unwrap_or(Value::Null))
                    }
                }
                Ok(Err(e)) => Err(e),
                // Sender dropped without a reply — reader died mid-route.
                Err(_) => Err(TransportError::ConnectionLost),
            },
            _ = tokio::time::sleep(self.request_timeout) => {
                self.remove_pending(id);
                Err(TransportError::Timeout(self.request_timeout))
            }
            _ = cancel.cancelled() => {
                self.remove_pending(id);
                Err(TransportError::Cancelled)
            }
        }
    }

    /// The southbound MCP handshake: `initialize`, the `initialized`
    /// notification, then the first `tools/list`.
    pub async fn handshake(&self, cancel: &CancellationToken) -> Result<Vec<Tool>, TransportError> {
        let params = json!({
            "protocolVersion": mcp::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "meshd",
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        let result = self.call(cancel, "initialize", Some(params)).await?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| TransportError::Protocol(format!("invalid initialize result: {e}")))?;
        debug!(
            server = %self.name,
            peer = %init.server_info.name,
            protocol = %init.protocol_version,
            "server initialized"
        );

        self.notify("initialized", Some(json!({}))).await?;

        let listed = self.call(cancel, "tools/list", None).await?;
        let tools: ToolsListResult = serde_json::from_value(listed)
            .map_err(|e| TransportError::Protocol(format!("invalid tools/list result: {e}")))?;
        Ok(tools.tools)
    }

    fn remove_pending(&self, id: i64) {
        self.pending.lock().expect("pending map poisoned").remove(&id);
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Reader task body: route reply lines until EOF, read error, or
/// cancellation — then drain.
async fn read_loop<R>(
    name: String,
    pending: Arc<StdMutex<PendingMap>>,
    reader: R,
    cancel: CancellationToken,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => route_line(&name, &pending, &line),
                Ok(None) => {
                    debug!(server = %name, "southbound stream closed");
                    break;
                }
                Err(e) => {
                    warn!(server = %name, err = %e, "southbound read error");
                    break;
                }
            },
        }
    }
    drain_pending(&name, &pending);
}

fn route_line(name: &str, pending: &StdMutex<PendingMap>, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    let resp = match serde_json::from_str::<Response>(line) {
        Ok(resp) if resp.is_reply() => resp,
        // Anything else — debug prints, echoed requests, banners — is
        // server output, not a reply.
        _ => {
            info!(server = %name, output = %line, "server output");
            return;
        }
    };

    let Some(id) = resp.id.as_i64() else {
        info!(server = %name, id = %resp.id, "reply with non-numeric id ignored");
        return;
    };

    let sender = pending.lock().expect("pending map poisoned").remove(&id);
    match sender {
        Some(tx) => {
            // A lost race with the caller's deadline is fine: the entry is
            // already gone and the reply drops here.
            let _ = tx.send(Ok(resp));
        }
        None => debug!(server = %name, id, "late reply dropped"),
    }
}

/// Complete every outstanding request with `connection lost` and empty the
/// map. Callers observe the failure in scheduler time, not after the
/// request timeout.
fn drain_pending(name: &str, pending: &StdMutex<PendingMap>) {
    let drained: Vec<(i64, oneshot::Sender<PendingReply>)> = pending
        .lock()
        .expect("pending map poisoned")
        .drain()
        .collect();
    if drained.is_empty() {
        return;
    }
    warn!(server = %name, count = drained.len(), "draining pending requests: connection lost");
    for (_, tx) in drained {
        let _ = tx.send(Err(TransportError::ConnectionLost));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn rpc(timeout: Duration) -> PipeRpc {
        PipeRpc::new("test", timeout)
    }

    #[tokio::test]
    async fn routes_reply_to_pending_call() {
        let rpc = rpc(Duration::from_secs(5));
        let (client_io, mut server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        rpc.attach(write_half, read_half).await;

        let cancel = CancellationToken::new();
        let call = tokio::spawn(async move { rpc.call(&cancel, "tools/list", None).await });

        // Read the request frame, answer it by id.
        let mut buf = vec![0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut server_io, &mut buf).await.unwrap();
        let req: Request = serde_json::from_slice(&buf[..n]).unwrap();
        let id = req.id.unwrap();
        let reply = format!(
            "{}\n",
            serde_json::to_string(&Response::ok(id, serde_json::json!({"tools": []}))).unwrap()
        );
        tokio::io::AsyncWriteExt::write_all(&mut server_io, reply.as_bytes())
            .await
            .unwrap();

        let result = call.await.unwrap().unwrap();
        assert_eq!(result["tools"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn call_fails_fast_when_stream_closes() {
        let rpc = Arc::new(rpc(Duration::from_secs(30)));
        let (client_io, server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        rpc.attach(write_half, read_half).await;

        let cancel = CancellationToken::new();
        let rpc2 = Arc::clone(&rpc);
        let call = tokio::spawn(async move { rpc2.call(&cancel, "tools/list", None).await });

        // Let the call register its pending entry, then kill the stream.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(server_io);

        let started = Instant::now();
        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("call did not fail fast on connection drop")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost), "got {err}");
        // Well under the 30s request timeout.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(rpc.pending_len(), 0);
    }

    #[tokio::test]
    async fn drain_runs_on_cancellation_too() {
        let rpc = Arc::new(rpc(Duration::from_secs(30)));
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        rpc.attach(write_half, read_half).await;

        let call_cancel = CancellationToken::new();
        let rpc2 = Arc::clone(&rpc);
        let guard = call_cancel.clone();
        let call = tokio::spawn(async move { rpc2.call(&guard, "tools/list", None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(rpc.pending_len(), 1);

        // Detach cancels the reader; the reader's exit drains the entry.
        rpc.detach().await;
        let err = tokio::time::timeout(Duration::from_secs(2), call)
            .await
            .expect("call did not resolve after detach")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost), "got {err}");
        assert_eq!(rpc.pending_len(), 0);
    }

    #[tokio::test]
    async fn deadline_removes_pending_entry() {
        let rpc = Arc::new(rpc(Duration::from_millis(50)));
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        rpc.attach(write_half, read_half).await;

        let cancel = CancellationToken::new();
        let err = rpc.call(&cancel, "tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)), "got {err}");
        assert_eq!(rpc.pending_len(), 0);
    }

    #[tokio::test]
    async fn caller_cancellation_removes_pending_entry() {
        let rpc = Arc::new(rpc(Duration::from_secs(30)));
        let (client_io, _server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        rpc.attach(write_half, read_half).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = rpc.call(&cancel, "tools/list", None).await.unwrap_err();
        assert!(matches!(err, TransportError::Cancelled), "got {err}");
        assert_eq!(rpc.pending_len(), 0);
    }

    #[tokio::test]
    async fn non_json_lines_are_skipped() {
        let rpc = rpc(Duration::from_secs(5));
        let (client_io, mut server_io) = tokio::io::duplex(4096);
        let (read_half, write_half) = tokio::io::split(client_io);
        rpc.attach(write_half, read_half).await;

        let cancel = CancellationToken::new();
        let call = tokio::spawn(async move { rpc.call(&cancel, "ping", None).await });

        let mut buf = vec![0u8; 4096];
        let n = tokio::io::AsyncReadExt::read(&mut server_io, &mut buf).await.unwrap();
        let req: Request = serde_json::from_slice(&buf[..n]).unwrap();

        // Debug chatter and blank lines before the real reply.
        let reply = format!(
            "DEBUG: starting up\n\n{}\n",
            serde_json::to_string(&Response::ok(req.id.unwrap(), serde_json::json!({}))).unwrap()
        );
        tokio::io::AsyncWriteExt::write_all(&mut server_io, reply.as_bytes())
            .await
            .unwrap();

        assert!(call.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn send_without_attach_is_not_connected() {
        let rpc = rpc(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let err = rpc.call(&cancel, "ping", None).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected), "got {err}");
        assert_eq!(rpc.pending_len(), 0);
    }
}
