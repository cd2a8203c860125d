// SPDX-License-Identifier: MIT
//! Peer-agent adapter — exposes another agent's advertised skills as a
//! virtual tool server.
//!
//! The peer speaks an agent-to-agent JSON-RPC dialect: an agent card at
//! `/.well-known/agent.json` advertises skills; `message/send` starts a
//! task; `tasks/get` reports task status. A non-terminal task is polled
//! until it settles or the caller's deadline fires.
//!
//! Terminal-state mapping: `completed` is a success, `failed` is a tool
//! error carrying the status message, and `cancelled`/`rejected` produce a
//! non-error result with whatever agent text was extracted — only `failed`
//! sets the error flag.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AgentClient, ClientState, TransportError, DEFAULT_REQUEST_TIMEOUT};
use crate::jsonrpc::{Request, Response};
use crate::mcp::{Content, ServerInfo, Tool, ToolArguments, ToolCallResult};

const AGENT_CARD_PATH: &str = "/.well-known/agent.json";
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Ceiling on how long a single skill invocation may stay non-terminal.
const TASK_DEADLINE: Duration = Duration::from_secs(120);

// ─── Peer protocol types ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AgentCard {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub skills: Vec<PeerSkill>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerSkill {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerTask {
    #[serde(default)]
    pub id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub messages: Vec<PeerMessage>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatus {
    pub state: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Part {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResult {
    #[serde(default)]
    pub task: Option<PeerTask>,
}

pub const TASK_STATE_COMPLETED: &str = "completed";
pub const TASK_STATE_FAILED: &str = "failed";
pub const TASK_STATE_CANCELLED: &str = "cancelled";
pub const TASK_STATE_REJECTED: &str = "rejected";

fn is_terminal(state: &str) -> bool {
    matches!(
        state,
        TASK_STATE_COMPLETED | TASK_STATE_FAILED | TASK_STATE_CANCELLED | TASK_STATE_REJECTED
    )
}

// ─── Adapter ─────────────────────────────────────────────────────────────────

pub struct PeerAgentClient {
    name: String,
    base_url: String,
    http: reqwest::Client,
    next_id: AtomicI64,
    state: RwLock<ClientState>,
    tools: RwLock<Vec<Tool>>,
    info: RwLock<Option<ServerInfo>>,
}

impl PeerAgentClient {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            http: reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            next_id: AtomicI64::new(1),
            state: RwLock::new(ClientState::Disconnected),
            tools: RwLock::new(Vec::new()),
            info: RwLock::new(None),
        }
    }

    pub async fn server_info(&self) -> Option<ServerInfo> {
        self.info.read().await.clone()
    }

    async fn fetch_card(&self) -> Result<AgentCard, TransportError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), AGENT_CARD_PATH);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Other(format!("fetching agent card: {e}")))?;
        if !resp.status().is_success() {
            return Err(TransportError::Other(format!(
                "fetching agent card: http status {}",
                resp.status()
            )));
        }
        resp.json::<AgentCard>()
            .await
            .map_err(|e| TransportError::Protocol(format!("decoding agent card: {e}")))
    }

    /// Poll the card endpoint until the peer answers, the timeout elapses,
    /// or the caller cancels. Peers come up asynchronously after
    /// provisioning; this bridges the gap.
    pub async fn wait_for_ready(
        &self,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.fetch_card().await.is_ok() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Other(format!(
                    "timeout waiting for peer agent '{}' to become ready",
                    self.name
                )));
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
        }
    }

    async fn rpc(
        &self,
        cancel: &CancellationToken,
        method: &str,
        params: Value,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = Request::new(id, method, Some(params));
        let send = self.http.post(&self.base_url).json(&req).send();
        let resp = tokio::select! {
            resp = send => resp.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(DEFAULT_REQUEST_TIMEOUT)
                } else {
                    TransportError::Other(format!("peer request: {e}"))
                }
            })?,
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
        };
        let body: Response = resp
            .json()
            .await
            .map_err(|e| TransportError::Protocol(format!("decoding peer response: {e}")))?;
        if let Some(err) = body.error {
            return Err(TransportError::Rpc(err));
        }
        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn poll_task(
        &self,
        cancel: &CancellationToken,
        task_id: &str,
    ) -> Result<PeerTask, TransportError> {
        let deadline = tokio::time::Instant::now() + TASK_DEADLINE;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(TransportError::Timeout(TASK_DEADLINE));
            }

            let result = self
                .rpc(cancel, "tasks/get", json!({"id": task_id}))
                .await?;
            let task: PeerTask = serde_json::from_value(result)
                .map_err(|e| TransportError::Protocol(format!("decoding task: {e}")))?;
            if is_terminal(&task.status.state) {
                return Ok(task);
            }
            debug!(server = %self.name, task = %task_id, state = %task.status.state, "peer task still running");
        }
    }
}

/// Map a settled peer task to a tool result.
fn task_to_result(task: Option<PeerTask>) -> ToolCallResult {
    let Some(task) = task else {
        return ToolCallResult::text("Task completed");
    };

    if task.status.state == TASK_STATE_FAILED {
        return ToolCallResult::error(task.status.message.unwrap_or_default());
    }

    // Agent messages and artifacts each contribute one text content item
    // per text part; everything else is dropped.
    let mut content = Vec::new();
    for msg in &task.messages {
        if msg.role != "agent" {
            continue;
        }
        for part in &msg.parts {
            if part.kind == "text" {
                if let Some(text) = &part.text {
                    content.push(Content::text(text.clone()));
                }
            }
        }
    }
    for artifact in &task.artifacts {
        for part in &artifact.parts {
            if part.kind == "text" {
                if let Some(text) = &part.text {
                    content.push(Content::text(text.clone()));
                }
            }
        }
    }
    if content.is_empty() {
        content.push(Content::text("Task completed"));
    }
    ToolCallResult {
        content,
        is_error: false,
    }
}

fn skills_to_tools(skills: &[PeerSkill]) -> Vec<Tool> {
    skills
        .iter()
        .map(|s| Tool {
            name: s.id.clone(),
            title: (!s.name.is_empty()).then(|| s.name.clone()),
            description: s.description.clone(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "Message to send to the agent skill",
                    },
                },
                "required": ["message"],
            }),
        })
        .collect()
}

#[async_trait]
impl AgentClient for PeerAgentClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        if *self.state.read().await == ClientState::Ready {
            return Ok(());
        }
        *self.state.write().await = ClientState::Connecting;

        match self.fetch_card().await {
            Ok(card) => {
                *self.tools.write().await = skills_to_tools(&card.skills);
                *self.info.write().await = Some(ServerInfo {
                    name: card.name,
                    version: card.version,
                });
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

    async fn refresh_tools(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        // The cached list is retained unchanged when the re-fetch fails.
        let card = self
            .fetch_card()
            .await
            .map_err(|e| TransportError::Other(format!("refreshing tools: {e}")))?;
        *self.tools.write().await = skills_to_tools(&card.skills);
        Ok(())
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolCallResult, TransportError> {
        let message = match arguments.get("message") {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => String::new(),
        };

        let params = json!({
            "skillId": name,
            "message": {
                "role": "user",
                "parts": [{"type": "text", "text": message}],
            },
        });

        let result = match self.rpc(cancel, "message/send", params).await {
            Ok(v) => v,
            Err(TransportError::Rpc(err)) => {
                // Skill failures come back as JSON-RPC errors; surface them
                // as tool errors, not transport failures.
                return Ok(ToolCallResult::error(format!("Error: {}", err.message)));
            }
            Err(e) => return Err(e),
        };
        let sent: SendMessageResult = serde_json::from_value(result)
            .map_err(|e| TransportError::Protocol(format!("decoding send result: {e}")))?;

        let task = match sent.task {
            Some(task) if !is_terminal(&task.status.state) => {
                match self.poll_task(cancel, &task.id).await {
                    Ok(task) => Some(task),
                    Err(TransportError::Cancelled) => return Err(TransportError::Cancelled),
                    Err(e) => {
                        return Ok(ToolCallResult::error(format!(
                            "error while waiting for completion: {e}"
                        )))
                    }
                }
            }
            other => other,
        };

        Ok(task_to_result(task))
    }

    async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    async fn close(&self) {
        *self.state.write().await = ClientState::Closed;
    }
}
