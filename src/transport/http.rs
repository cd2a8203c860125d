// SPDX-License-Identifier: MIT
//! HTTP client — each JSON-RPC exchange is a single POST of the request
//! body; id bookkeeping is local and disposable, there is no pending map.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AgentClient, ClientState, TransportError, DEFAULT_REQUEST_TIMEOUT};
use crate::jsonrpc::{Request, Response};
use crate::mcp::{self, Tool, ToolArguments, ToolCallResult, ToolsListResult};

pub struct HttpClient {
    name: String,
    url: String,
    http: reqwest::Client,
    next_id: AtomicI64,
    request_timeout: Duration,
    state: RwLock<ClientState>,
    tools: RwLock<Vec<Tool>>,
}

impl HttpClient {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let request_timeout = DEFAULT_REQUEST_TIMEOUT;
        Self {
            name: name.into(),
            url: url.into(),
            http: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .unwrap_or_default(),
            next_id: AtomicI64::new(1),
            request_timeout,
            state: RwLock::new(ClientState::Disconnected),
            tools: RwLock::new(Vec::new()),
        }
    }

    async fn call(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = Request::new(id, method, params);

        let send = self.http.post(&self.url).json(&req).send();
        let resp = tokio::select! {
            resp = send => resp.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.request_timeout)
                } else {
                    TransportError::Other(format!("http request: {e}"))
                }
            })?,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };

        if !resp.status().is_success() {
            return Err(TransportError::Other(format!(
                "http status {}",
                resp.status()
            )));
        }

        let body: Response = tokio::select! {
            body = resp.json::<Response>() => body
                .map_err(|e| TransportError::Protocol(format!("decoding response: {e}")))?,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };

        if let Some(err) = body.error {
            return Err(TransportError::Rpc(err));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn fetch_tools(&self, cancel: &CancellationToken) -> Result<Vec<Tool>, TransportError> {
        let listed = self.call(cancel, "tools/list", None).await?;
        let parsed: ToolsListResult = serde_json::from_value(listed)
            .map_err(|e| TransportError::Protocol(format!("invalid tools/list result: {e}")))?;
        Ok(parsed.tools)
    }
}

#[async_trait]
impl AgentClient for HttpClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        if *self.state.read().await == ClientState::Ready {
            return Ok(());
        }
        *self.state.write().await = ClientState::Connecting;

        let params = json!({
            "protocolVersion": mcp::PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "meshd", "version": env!("CARGO_PKG_VERSION")},
        });
        let handshake = async {
            self.call(cancel, "initialize", Some(params)).await?;
            self.fetch_tools(cancel).await
        };
        match handshake.await {
            Ok(tools) => {
                debug!(server = %self.name, tools = tools.len(), "http client ready");
                *self.tools.write().await = tools;
                *self.state.write().await = ClientState::Ready;
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    async fn tools(&self) -> Vec<Tool> {
        self.tools.read().await.clone()
    }

    async fn refresh_tools(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        let tools = self.fetch_tools(cancel).await?;
        *self.tools.write().await = tools;
        Ok(())
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolCallResult, TransportError> {
        let params = json!({"name": name, "arguments": arguments});
        let value = self.call(cancel, "tools/call", Some(params)).await?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("invalid tools/call result: {e}")))
    }

    async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    async fn close(&self) {
        *self.state.write().await = ClientState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_fails_initialize() {
        let client = HttpClient::new("test", "http://127.0.0.1:1/rpc");
        let err = client
            .initialize(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(!matches!(err, TransportError::Cancelled));
        assert_eq!(client.state().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn cancellation_wins_over_slow_request() {
        let client = HttpClient::new("test", "http://127.0.0.1:1/rpc");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .call(&cancel, "tools/list", None)
            .await
            .unwrap_err();
        // Either the connect error or cancellation may win the race against
        // a dead endpoint; a cancelled token must never hang.
        assert!(
            matches!(err, TransportError::Cancelled | TransportError::Other(_)),
            "got {err}"
        );
    }
}
