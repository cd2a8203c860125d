// SPDX-License-Identifier: MIT
//! Remote-shell client — runs the tool server on another host through an
//! `ssh` child process and speaks JSON-RPC over the channel's stdio. The
//! pipe mechanics are identical to the local process client; only the argv
//! differs. ssh banners and remote diagnostics land on stderr and are
//! logged at warn by the shared stderr task.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::process::ProcessClient;
use super::{AgentClient, ClientState, TransportError};
use crate::mcp::{Tool, ToolArguments, ToolCallResult};

#[derive(Debug, Clone)]
pub struct RemoteShellConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
    /// Command line executed on the remote host.
    pub command: String,
}

pub struct RemoteShellClient {
    inner: ProcessClient,
}

impl RemoteShellClient {
    pub fn new(name: impl Into<String>, config: RemoteShellConfig) -> Self {
        Self {
            inner: ProcessClient::new(name, build_argv(&config), None, HashMap::new()),
        }
    }
}

fn build_argv(config: &RemoteShellConfig) -> Vec<String> {
    let mut argv = vec!["ssh".to_string(), "-o".into(), "BatchMode=yes".into()];
    if let Some(port) = config.port {
        argv.push("-p".into());
        argv.push(port.to_string());
    }
    if let Some(identity) = &config.identity_file {
        argv.push("-i".into());
        argv.push(identity.display().to_string());
    }
    let target = match &config.user {
        Some(user) => format!("{user}@{}", config.host),
        None => config.host.clone(),
    };
    argv.push(target);
    argv.push(config.command.clone());
    argv
}

#[async_trait]
impl AgentClient for RemoteShellClient {
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
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_carries_all_options() {
        let argv = build_argv(&RemoteShellConfig {
            host: "tools.example.com".into(),
            user: Some("ops".into()),
            port: Some(2222),
            identity_file: Some(PathBuf::from("/home/ops/.ssh/id_ed25519")),
            command: "/opt/bin/tool-server --stdio".into(),
        });
        assert_eq!(argv[0], "ssh");
        assert!(argv.contains(&"-p".to_string()));
        assert!(argv.contains(&"2222".to_string()));
        assert!(argv.contains(&"-i".to_string()));
        assert!(argv.contains(&"ops@tools.example.com".to_string()));
        assert_eq!(argv.last().unwrap(), "/opt/bin/tool-server --stdio");
    }

    #[test]
    fn argv_minimal() {
        let argv = build_argv(&RemoteShellConfig {
            host: "box".into(),
            user: None,
            port: None,
            identity_file: None,
            command: "server".into(),
        });
        assert_eq!(
            argv,
            vec!["ssh", "-o", "BatchMode=yes", "box", "server"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }
}
