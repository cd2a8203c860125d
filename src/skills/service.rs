// SPDX-License-Identifier: MIT
//! The skill service — an in-process tool server over the skill store.
//!
//! Registered with the router under the reserved name `skills`, it exposes
//! active executable skills as tools (routing calls into the workflow
//! executor) and every active skill as a prompt document. Skills without a
//! workflow stay knowledge documents: prompts, never tools.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::store::SkillStore;
use super::SkillState;
use crate::mcp::{
    Content, Prompt, PromptArgument, PromptGetResult, PromptMessage, Tool, ToolArguments,
    ToolCallResult,
};
use crate::transport::{AgentClient, ClientState, TransportError};
use crate::workflow::{ExecutionOutcome, Executor};

/// Reserved server name; skill tools appear as `skills__«name»`.
pub const SKILLS_CLIENT_NAME: &str = "skills";

pub struct SkillService {
    store: Arc<SkillStore>,
    executor: Option<Executor>,
    state: RwLock<ClientState>,
}

impl SkillService {
    /// Without an executor the service still serves prompts; executable
    /// skills answer calls with an informational error.
    pub fn new(store: Arc<SkillStore>, executor: Option<Executor>) -> Self {
        Self {
            store,
            executor,
            state: RwLock::new(ClientState::Disconnected),
        }
    }

    pub fn store(&self) -> &Arc<SkillStore> {
        &self.store
    }

    pub fn has_content(&self) -> bool {
        self.store.has_content()
    }

    /// Active skills as MCP prompts, each with one optional `context`
    /// argument.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.store
            .active()
            .into_iter()
            .map(|s| Prompt {
                name: s.name,
                description: s.description,
                arguments: vec![PromptArgument {
                    name: "context".into(),
                    description: "Additional context for the skill".into(),
                    required: false,
                }],
            })
            .collect()
    }

    pub fn get_prompt(&self, name: &str) -> Result<PromptGetResult, String> {
        let skill = self
            .store
            .get(name)
            .map_err(|_| format!("prompt not found: {name}"))?;
        if skill.state != SkillState::Active {
            return Err(format!("skill '{name}' is not active (state: {})", skill.state));
        }
        Ok(PromptGetResult {
            description: skill.description,
            messages: vec![PromptMessage {
                role: "user".into(),
                content: Content::text(skill.body),
            }],
        })
    }

    /// Run an executable skill directly (REST surface). Tool calls arrive
    /// through [`AgentClient::call_tool`] instead.
    pub async fn execute_skill(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> anyhow::Result<ExecutionOutcome> {
        let skill = self
            .store
            .get(name)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        if !skill.is_executable() {
            anyhow::bail!("skill '{name}' has no workflow definition");
        }
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("workflow execution is not available"))?;
        executor.execute(cancel, &skill, Some(arguments)).await
    }
}

#[async_trait]
impl AgentClient for SkillService {
    fn name(&self) -> &str {
        SKILLS_CLIENT_NAME
    }

    async fn initialize(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        self.store
            .load()
            .map_err(|e| TransportError::Other(format!("loading skill store: {e}")))?;
        *self.state.write().await = ClientState::Ready;
        Ok(())
    }

    async fn tools(&self) -> Vec<Tool> {
        if self.executor.is_none() {
            return Vec::new();
        }
        self.store
            .active()
            .iter()
            .filter(|s| s.is_executable())
            .map(|s| s.to_tool())
            .collect()
    }

    async fn refresh_tools(&self, _cancel: &CancellationToken) -> Result<(), TransportError> {
        self.store
            .load()
            .map_err(|e| TransportError::Other(format!("reloading skill store: {e}")))
    }

    async fn call_tool(
        &self,
        cancel: &CancellationToken,
        name: &str,
        arguments: ToolArguments,
    ) -> Result<ToolCallResult, TransportError> {
        let skill = self
            .store
            .get(name)
            .map_err(|_| TransportError::Other(format!("skill '{name}' not found")))?;
        if !skill.is_executable() {
            return Ok(ToolCallResult::error(
                "This skill is a knowledge document, not executable.",
            ));
        }
        let Some(executor) = &self.executor else {
            return Ok(ToolCallResult::error(
                "Workflow execution is not available (no tool caller configured).",
            ));
        };

        let outcome = executor
            .execute(cancel, &skill, Some(arguments))
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(outcome.result)
    }

    async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    async fn close(&self) {
        *self.state.write().await = ClientState::Closed;
    }
}
