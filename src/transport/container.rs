// SPDX-License-Identifier: MIT
//! Container-attach client — reaches a tool server already running inside a
//! container by attaching through the runtime's exec channel
//! (`docker exec -i …` by default; the runtime binary is configurable).
//!
//! Closing this client detaches the exec channel; the container itself is
//! provisioned and reaped elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::process::ProcessClient;
use super::{AgentClient, ClientState, TransportError};
use crate::mcp::{Tool, ToolArguments, ToolCallResult};

pub const DEFAULT_RUNTIME: &str = "docker";

#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Container name or id to attach to.
    pub container: String,
    /// Runtime binary: docker, podman, nerdctl.
    pub runtime: String,
    /// Command executed inside the container.
    pub command: Vec<String>,
}

pub struct ContainerClient {
    inner: ProcessClient,
}

impl ContainerClient {
    pub fn new(name: impl Into<String>, config: ContainerConfig) -> Self {
        Self {
            inner: ProcessClient::new(name, build_argv(&config), None, HashMap::new()),
        }
    }
}

fn build_argv(config: &ContainerConfig) -> Vec<String> {
    let runtime = if config.runtime.is_empty() {
        DEFAULT_RUNTIME.to_string()
    } else {
        config.runtime.clone()
    };
    let mut argv = vec![runtime, "exec".into(), "-i".into(), config.container.clone()];
    argv.extend(config.command.iter().cloned());
    argv
}

#[async_trait]
impl AgentClient for ContainerClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn initialize(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.inner.initialize(cancel).await
    }

    async fn tools(&self) -> Vec<Tool> {
        self.inner.tools().await
    }

    async fn refresh_tools(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        self.inner.refresh_tools(cancel).await
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolCallResult, TransportError> {
        self.inner.call_tool(cancel, name, arguments).await
    }

    async fn state(&self) -> ClientState {
        self.inner.state().await
    }

    async fn close(&self) {
        // Kills only the exec client process — detaches without touching
        // the container.
        self.inner.close().await
    }
}
