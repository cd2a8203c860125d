// SPDX-License-Identifier: MIT
//! Southbound transport clients.
//!
//! Every client — child process, remote shell, container attach, HTTP, peer
//! agent — implements the same [`AgentClient`] contract so the router can own
//! them uniformly. The pipe-style clients share the framing, pending-request
//! and drain machinery in [`pipe`].

pub mod container;
pub mod http;
pub mod peer;
pub mod pipe;
pub mod process;
pub mod remote;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::jsonrpc::RpcError;
use crate::mcp::{Tool, ToolArguments, ToolCallResult};

/// Default deadline for one southbound request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection lifecycle of a southbound client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Ready,
    Reconnecting,
    Closed,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Ready => "ready",
            ClientState::Reconnecting => "reconnecting",
            ClientState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Transport-level failure taxonomy. Tool-reported errors are *not* here —
/// they travel inside [`ToolCallResult::is_error`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The southbound reader exited while requests were outstanding.
    #[error("connection lost")]
    ConnectionLost,
    /// The per-request deadline elapsed. Distinct from cancellation.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The caller's cancellation signal fired.
    #[error("cancelled")]
    Cancelled,
    /// The client has no live connection to write to.
    #[error("not connected")]
    NotConnected,
    /// The peer answered with a JSON-RPC error object.
    #[error("server error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

/// The contract every southbound client satisfies.
///
/// `initialize` is idempotent: a second call after `ready` is a no-op, and a
/// call after a failed attempt retries from the start. `refresh_tools`
/// retains the cached list when the re-fetch fails. `close` is idempotent.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Stable identifier; used as the catalog prefix.
    fn name(&self) -> &str;

    async fn initialize(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    /// The cached, unprefixed tool list.
    async fn tools(&self) -> Vec<Tool>;

    async fn refresh_tools(&self, cancel: &CancellationToken) -> Result<(), TransportError>;

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolCallResult, TransportError>;

    async fn state(&self) -> ClientState;

    async fn close(&self);
}
