// SPDX-License-Identifier: MIT
//! Child-process client — spawns a tool server and speaks JSON-RPC over its
//! stdin/stdout pipes. Stderr is drained by a side task and logged at warn.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pipe::PipeRpc;
use super::{AgentClient, ClientState, TransportError, DEFAULT_REQUEST_TIMEOUT};
use crate::mcp::{Tool, ToolArguments, ToolCallResult, ToolsListResult};

pub struct ProcessClient {
    command: Vec<String>,
    workdir: Option<PathBuf>,
    env: HashMap<String, String>,
    rpc: PipeRpc,
    child: Mutex<Option<Child>>,
    state: RwLock<ClientState>,
    tools: RwLock<Vec<Tool>>,
}

impl ProcessClient {
    pub fn new(
        name: impl Into<String>,
        command: Vec<String>,
        workdir: Option<PathBuf>,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            command,
            workdir,
            env,
            rpc: PipeRpc::new(name, DEFAULT_REQUEST_TIMEOUT),
            child: Mutex::new(None),
            state: RwLock::new(ClientState::Disconnected),
            tools: RwLock::new(Vec::new()),
        }
    }

    /// Spawn the process, wire the pipes into the RPC core, run the
    /// handshake. Leaves the client torn down on any failure so a later
    /// `initialize` retries from the start.
    async fn connect(&self, cancel: &CancellationToken) -> Result<Vec<Tool>, TransportError> {
        if self.command.is_empty() {
            return Err(TransportError::Other("no command specified".into()));
        }

        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }
        // Custom vars layer over the inherited environment.
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TransportError::Other(format!("starting process: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Other("child stdin not available".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Other("child stdout not available".into()))?;
        let stderr = child.stderr.take();

        let reader_token = self.rpc.attach(stdin, stdout).await;
        if let Some(stderr) = stderr {
            spawn_stderr_logger(self.rpc.name().to_string(), stderr, reader_token.child_token());
        }
        *self.child.lock().await = Some(child);

        match self.rpc.handshake(cancel).await {
            Ok(tools) => Ok(tools),
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn teardown(&self) {
        self.rpc.detach().await;
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server = %self.rpc.name(), err = %e, "kill after teardown");
            }
        }
    }

    /// Tear down and run the handshake again. Used by operators when a
    /// server wedges; not part of the client contract.
    pub async fn reconnect(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        *self.state.write().await = ClientState::Reconnecting;
        self.teardown().await;
        *self.state.write().await = ClientState::Disconnected;
        self.initialize(cancel).await
    }
}

#[async_trait]
impl AgentClient for ProcessClient {
    fn name(&self) -> &str {
        self.rpc.name()
    }

    async fn initialize(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        if *self.state.read().await == ClientState::Ready {
            return Ok(());
        }
        *self.state.write().await = ClientState::Connecting;

        match self.connect(cancel).await {
            Ok(tools) => {
                debug!(server = %self.rpc.name(), tools = tools.len(), "process client ready");
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
        let listed = self.rpc.call(cancel, "tools/list", None).await?;
        let parsed: ToolsListResult = serde_json::from_value(listed)
            .map_err(|e| TransportError::Protocol(format!("invalid tools/list result: {e}")))?;
        *self.tools.write().await = parsed.tools;
        Ok(())
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolCallResult, TransportError> {
        let params = json!({"name": name, "arguments": arguments});
        let result = self.rpc.call(cancel, "tools/call", Some(params)).await;
        if matches!(result, Err(TransportError::ConnectionLost)) {
            *self.state.write().await = ClientState::Disconnected;
        }
        let value = result?;
        serde_json::from_value(value)
            .map_err(|e| TransportError::Protocol(format!("invalid tools/call result: {e}")))
    }

    async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    async fn close(&self) {
        self.teardown().await;
        *self.state.write().await = ClientState::Closed;
    }
}

/// Log every stderr line from the child at warn until EOF or cancellation.
fn spawn_stderr_logger(name: String, stderr: ChildStderr, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line {
                    Ok(Some(line)) if !line.trim().is_empty() => {
                        warn!(server = %name, output = %line, "server stderr");
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => break,
                },
            }
        }
    });
}
