// SPDX-License-Identifier: MIT
//! Agent-scoped access control.
//!
//! An agent is a named identity bound to a list of [`ToolSelector`]s.
//! Selectors are additive; an unregistered agent (or an empty agent name)
//! is unrestricted. Matching is on unprefixed tool names with a small
//! explicit glob matcher: `*` is zero-or-more characters, `?` exactly one,
//! literals are case-sensitive.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::mcp::Tool;
use crate::router::split_tool_name;

/// `{server, tools}` — empty `tools` allows every tool of that server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSelector {
    pub server: String,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Default)]
pub struct AclRegistry {
    agents: RwLock<HashMap<String, Vec<ToolSelector>>>,
}

impl AclRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an agent to its selectors. An empty selector list is the same
    /// as not registering the agent at all.
    pub async fn register_agent(&self, name: impl Into<String>, selectors: Vec<ToolSelector>) {
        let name = name.into();
        let mut agents = self.agents.write().await;
        if selectors.is_empty() {
            agents.remove(&name);
        } else {
            agents.insert(name, selectors);
        }
    }

    pub async fn registered_agents(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// May `agent` call `server`'s unprefixed `tool`?
    pub async fn allows(&self, agent: &str, server: &str, tool: &str) -> bool {
        if agent.is_empty() {
            return true;
        }
        let agents = self.agents.read().await;
        let Some(selectors) = agents.get(agent) else {
            return true;
        };
        selectors.iter().any(|sel| {
            sel.server == server
                && (sel.tools.is_empty() || sel.tools.iter().any(|g| glob_match(g, tool)))
        })
    }

    /// Intersect a prefixed catalog view with the agent's selectors.
    pub async fn filter_tools(&self, agent: &str, tools: Vec<Tool>) -> Vec<Tool> {
        if agent.is_empty() {
            return tools;
        }
        let agents = self.agents.read().await;
        let Some(selectors) = agents.get(agent) else {
            return tools;
        };
        tools
            .into_iter()
            .filter(|t| {
                let Some((server, tool)) = split_tool_name(&t.name) else {
                    return false;
                };
                selectors.iter().any(|sel| {
                    sel.server == server
                        && (sel.tools.is_empty() || sel.tools.iter().any(|g| glob_match(g, tool)))
                })
            })
            .collect()
    }
}

/// Match `text` against `pattern` where `*` is zero-or-more characters and
/// `?` is exactly one. Iterative with single-star backtracking; no regex
/// engine behind it.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == txt[t]) {
            p += 1;
            t += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, t));
            p += 1;
        } else if let Some((sp, st)) = star {
            // Backtrack: let the last star swallow one more character.
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        Tool {
            name: name.into(),
            title: None,
            description: String::new(),
            input_schema: json!({"type": "object"}),
        }
    }

    #[test]
    fn glob_literals_are_case_sensitive() {
        assert!(glob_match("read", "read"));
        assert!(!glob_match("Read", "read"));
        assert!(!glob_match("read", "reader"));
    }

    #[test]
    fn glob_star_and_question() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*", ""));
        assert!(glob_match("read_*", "read_file"));
        assert!(glob_match("*_file", "read_file"));
        assert!(glob_match("r??d", "read"));
        assert!(!glob_match("r?d", "read"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
    }

    #[tokio::test]
    async fn unregistered_agent_allows_everything() {
        let acl = AclRegistry::new();
        assert!(acl.allows("ghost", "server1", "anything").await);
        assert!(acl.allows("", "server1", "anything").await);
    }

    #[tokio::test]
    async fn empty_tools_selector_allows_whole_server() {
        let acl = AclRegistry::new();
        acl.register_agent(
            "agent",
            vec![ToolSelector {
                server: "server1".into(),
                tools: vec![],
            }],
        )
        .await;

        assert!(acl.allows("agent", "server1", "read").await);
        assert!(acl.allows("agent", "server1", "write").await);
        assert!(!acl.allows("agent", "server2", "read").await);
    }

    #[tokio::test]
    async fn selectors_are_additive() {
        let acl = AclRegistry::new();
        acl.register_agent(
            "agent",
            vec![
                ToolSelector {
                    server: "server1".into(),
                    tools: vec!["read*".into()],
                },
                ToolSelector {
                    server: "server2".into(),
                    tools: vec![],
                },
            ],
        )
        .await;

        assert!(acl.allows("agent", "server1", "read_file").await);
        assert!(!acl.allows("agent", "server1", "write").await);
        assert!(acl.allows("agent", "server2", "anything").await);
    }

    #[tokio::test]
    async fn filter_is_the_exact_intersection() {
        let acl = AclRegistry::new();
        acl.register_agent(
            "restricted",
            vec![ToolSelector {
                server: "server1".into(),
                tools: vec!["allowed".into()],
            }],
        )
        .await;

        let catalog = vec![
            tool("server1__allowed"),
            tool("server1__denied"),
            tool("server2__list"),
        ];

        let filtered = acl.filter_tools("restricted", catalog.clone()).await;
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].name, "server1__allowed");

        // No agent identity sees the raw catalog.
        let all = acl.filter_tools("", catalog).await;
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn registering_empty_selectors_unregisters() {
        let acl = AclRegistry::new();
        acl.register_agent(
            "agent",
            vec![ToolSelector {
                server: "server1".into(),
                tools: vec![],
            }],
        )
        .await;
        assert!(!acl.allows("agent", "server2", "x").await);

        acl.register_agent("agent", vec![]).await;
        assert!(acl.allows("agent", "server2", "x").await);
    }
}
