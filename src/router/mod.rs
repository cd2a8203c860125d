// SPDX-License-Identifier: MIT
//! Tool catalog and router.
//!
//! The router owns every southbound client and a flat index from prefixed
//! tool name (`«server»__«tool»`) to the owning client. Lookups take the
//! read lock; add/remove/refresh rebuild the index under the write lock —
//! never across a network call.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::mcp::{Tool, ToolArguments, ToolCallResult};
use crate::transport::{AgentClient, TransportError};

/// Separator between the server prefix and the tool name. Server and tool
/// names match `[a-zA-Z0-9_-]+`; the split is at the first occurrence.
pub const TOOL_SEPARATOR: &str = "__";

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Default)]
pub struct Router {
    clients: RwLock<HashMap<String, Arc<dyn AgentClient>>>,
    index: RwLock<HashMap<String, String>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client. Replaces any previous client of the same name and
    /// indexes its currently-cached tools.
    pub async fn add_client(&self, client: Arc<dyn AgentClient>) {
        let name = client.name().to_string();
        let tools = client.tools().await;
        {
            let mut clients = self.clients.write().await;
            clients.insert(name.clone(), client);
        }
        {
            let mut index = self.index.write().await;
            index.retain(|_, owner| owner != &name);
            for tool in &tools {
                index.insert(prefixed(&name, &tool.name), name.clone());
            }
        }
        info!(server = %name, tools = tools.len(), "client registered");
    }

    /// Evict a client and its index entries. The client itself is closed by
    /// the caller; the router only forgets it.
    pub async fn remove_client(&self, name: &str) -> Option<Arc<dyn AgentClient>> {
        let removed = self.clients.write().await.remove(name);
        if removed.is_some() {
            self.index.write().await.retain(|_, owner| owner != name);
            info!(server = %name, "client removed");
        }
        removed
    }

    pub async fn client(&self, name: &str) -> Option<Arc<dyn AgentClient>> {
        self.clients.read().await.get(name).cloned()
    }

    pub async fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Ask every client to re-fetch its tool list, then rebuild the index.
    /// Per-client failures are logged and that client's cached list stands.
    pub async fn refresh_tools(&self, cancel: &CancellationToken) {
        let clients: Vec<Arc<dyn AgentClient>> =
            self.clients.read().await.values().cloned().collect();

        // Network I/O happens here, before any lock is taken.
        for client in &clients {
            if let Err(e) = client.refresh_tools(cancel).await {
                warn!(server = %client.name(), err = %e, "tool refresh failed; keeping cached list");
            }
        }

        self.rebuild_index().await;
    }

    /// Rebuild the prefixed index from the clients' cached tool lists.
    pub async fn rebuild_index(&self) {
        let clients: Vec<Arc<dyn AgentClient>> =
            self.clients.read().await.values().cloned().collect();

        let mut fresh = HashMap::new();
        for client in &clients {
            let name = client.name().to_string();
            for tool in client.tools().await {
                fresh.insert(prefixed(&name, &tool.name), name.clone());
            }
        }

        let count = fresh.len();
        *self.index.write().await = fresh;
        info!(tools = count, "tool index rebuilt");
    }

    /// The aggregated catalog with prefixed names, sorted for stable
    /// listings.
    pub async fn all_tools(&self) -> Vec<Tool> {
        let clients: Vec<Arc<dyn AgentClient>> =
            self.clients.read().await.values().cloned().collect();

        let mut tools = Vec::new();
        for client in &clients {
            let name = client.name();
            for mut tool in client.tools().await {
                tool.name = prefixed(name, &tool.name);
                tools.push(tool);
            }
        }
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Resolve a prefixed name to its owning client and unprefixed tool.
    pub async fn resolve(&self, prefixed_name: &str) -> Option<(Arc<dyn AgentClient>, String)> {
        let (server, tool) = split_tool_name(prefixed_name)?;
        let owner = {
            let index = self.index.read().await;
            index.get(prefixed_name).cloned()
        };
        // The index is authoritative, but a client registered after the last
        // rebuild is still routable by its prefix.
        let owner = owner.unwrap_or_else(|| server.to_string());
        let client = self.clients.read().await.get(&owner).cloned()?;
        Some((client, tool.to_string()))
    }

    /// Route a `tools/call` to the owning client.
    pub async fn call_tool(
        &self,
        cancel: &CancellationToken,
        prefixed_name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolCallResult, RouteError> {
        let (client, tool) = self
            .resolve(prefixed_name)
            .await
            .ok_or_else(|| RouteError::ToolNotFound(prefixed_name.to_string()))?;
        Ok(client.call_tool(cancel, &tool, arguments).await?)
    }

    /// Close every client. Used on gateway shutdown.
    pub async fn close_all(&self) {
        let clients: Vec<Arc<dyn AgentClient>> =
            self.clients.read().await.values().cloned().collect();
        for client in clients {
            client.close().await;
        }
    }
}

/// The router as a [`crate::workflow::ToolCaller`]. Holds a weak reference
/// so the skill service (owned by the router) never keeps the router alive
/// in a cycle.
pub struct RouterCaller(std::sync::Weak<Router>);

impl RouterCaller {
    pub fn new(router: &Arc<Router>) -> Self {
        Self(Arc::downgrade(router))
    }
}

#[async_trait::async_trait]
impl crate::workflow::ToolCaller for RouterCaller {
    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> anyhow::Result<ToolCallResult> {
        let router = self
            .0
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("gateway is shutting down"))?;
        Ok(router.call_tool(cancel, name, arguments).await?)
    }
}

pub fn prefixed(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_SEPARATOR}{tool}")
}

/// Server and tool names are `[a-zA-Z0-9_-]+`; anything else cannot be
/// split back out of a composite name reliably.
pub fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Split `«server»__«tool»` at the first `__`. Returns `None` when either
/// side is empty or the separator is missing.
pub fn split_tool_name(name: &str) -> Option<(&str, &str)> {
    let (server, tool) = name.split_once(TOOL_SEPARATOR)?;
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server, tool))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_at_first_separator() {
        assert_eq!(split_tool_name("fs__read"), Some(("fs", "read")));
        // A tool whose own name contains the separator keeps the remainder.
        assert_eq!(split_tool_name("a__b__c"), Some(("a", "b__c")));
        assert_eq!(split_tool_name("noseparator"), None);
        assert_eq!(split_tool_name("__tool"), None);
        assert_eq!(split_tool_name("server__"), None);
    }

    #[test]
    fn prefix_roundtrip() {
        let name = prefixed("server1", "allowed");
        assert_eq!(split_tool_name(&name), Some(("server1", "allowed")));
    }

    #[test]
    fn name_grammar() {
        assert!(valid_name("fs-tools_2"));
        assert!(!valid_name(""));
        assert!(!valid_name("bad name"));
        assert!(!valid_name("dotted.name"));
    }
}
