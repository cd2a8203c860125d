// SPDX-License-Identifier: MIT
//! meshd — MCP tool-mesh gateway.
//!
//! One northbound JSON-RPC/SSE surface, many southbound tool servers
//! (child process, remote shell, container attach, HTTP, peer agent), an
//! agent-scoped ACL, and a skill layer that turns declarative tool
//! workflows into callable tools and prompts.

pub mod acl;
pub mod config;
pub mod gateway;
pub mod jsonrpc;
pub mod mcp;
pub mod rest;
pub mod router;
pub mod skills;
pub mod sse;
pub mod transport;
pub mod workflow;

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use acl::AclRegistry;
use config::{GatewayConfig, ServerEntry, StackConfig, TransportEntry};
use gateway::Gateway;
use router::{Router, RouterCaller};
use skills::service::{SkillService, SKILLS_CLIENT_NAME};
use skills::store::SkillStore;
use sse::SessionManager;
use transport::container::{ContainerClient, ContainerConfig};
use transport::http::HttpClient;
use transport::peer::PeerAgentClient;
use transport::process::ProcessClient;
use transport::remote::{RemoteShellClient, RemoteShellConfig};
use transport::AgentClient;
use workflow::{Executor, ExecutorConfig};

/// Shared state handed to every HTTP handler and background task.
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub router: Arc<Router>,
    pub acl: Arc<AclRegistry>,
    pub store: Arc<SkillStore>,
    pub skills: Arc<SkillService>,
    pub gateway: Arc<Gateway>,
    pub sessions: Arc<SessionManager>,
    /// Root cancellation token; cancelled once on shutdown.
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

impl GatewayContext {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let router = Arc::new(Router::new());
        let acl = Arc::new(AclRegistry::new());
        let store = Arc::new(SkillStore::new(config.data_dir.clone()));

        let executor = Executor::new(
            Arc::new(RouterCaller::new(&router)),
            ExecutorConfig {
                max_parallel: config.workflow.max_parallel,
                max_depth: config.workflow.max_depth,
                deadline: config.workflow.deadline,
            },
        );
        let skills = Arc::new(SkillService::new(Arc::clone(&store), Some(executor)));
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&router),
            Arc::clone(&acl),
            Arc::clone(&skills),
        ));
        let sessions = Arc::new(SessionManager::new(
            config.message_path.clone(),
            config.session_max_age,
        ));

        Arc::new(Self {
            config,
            router,
            acl,
            store,
            skills,
            gateway,
            sessions,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
        })
    }

    /// Register or deregister the skill service with the router depending
    /// on whether the store has content, then rebuild the index. Called at
    /// startup and after every store mutation.
    pub async fn refresh_skill_registration(&self) {
        if self.skills.has_content() {
            let service: Arc<dyn AgentClient> = self.skills.clone();
            self.router.add_client(service).await;
        } else {
            self.router.remove_client(SKILLS_CLIENT_NAME).await;
        }
        self.router.rebuild_index().await;
    }

    /// Bring the declared stack up: bind agents, build and initialize each
    /// southbound client, load the skill store. A client that fails to
    /// initialize stays registered in `disconnected` state — the gateway
    /// serves whatever subset came up.
    pub async fn bootstrap(&self, stack: &StackConfig) {
        for agent in &stack.agents {
            self.acl
                .register_agent(agent.name.clone(), agent.tools.clone())
                .await;
        }
        if !stack.agents.is_empty() {
            info!(agents = stack.agents.len(), "agent ACL bindings registered");
        }

        for entry in &stack.servers {
            if entry.name == SKILLS_CLIENT_NAME {
                warn!(server = %entry.name, "server name is reserved; skipping");
                continue;
            }
            if !router::valid_name(&entry.name) {
                warn!(server = %entry.name, "server name must match [a-zA-Z0-9_-]+; skipping");
                continue;
            }
            let client = build_client(entry);
            if let Err(e) = client.initialize(&self.shutdown).await {
                warn!(server = %entry.name, err = %e, "client failed to initialize; will stay registered as disconnected");
            }
            self.router.add_client(client).await;
        }

        if let Err(e) = self.skills.initialize(&self.shutdown).await {
            warn!(err = %e, "skill store failed to load; starting empty");
        }
        self.refresh_skill_registration().await;
    }

    /// Cancel everything and close every southbound client.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.router.close_all().await;
    }
}

/// Construct the transport client for one stack entry.
pub fn build_client(entry: &ServerEntry) -> Arc<dyn AgentClient> {
    match &entry.transport {
        TransportEntry::Process {
            command,
            env,
            workdir,
        } => Arc::new(ProcessClient::new(
            entry.name.clone(),
            command.clone(),
            workdir.clone(),
            env.clone(),
        )),
        TransportEntry::Remote {
            host,
            user,
            port,
            identity_file,
            command,
        } => Arc::new(RemoteShellClient::new(
            entry.name.clone(),
            RemoteShellConfig {
                host: host.clone(),
                user: user.clone(),
                port: *port,
                identity_file: identity_file.clone(),
                command: command.clone(),
            },
        )),
        TransportEntry::Container {
            container,
            runtime,
            command,
        } => Arc::new(ContainerClient::new(
            entry.name.clone(),
            ContainerConfig {
                container: container.clone(),
                runtime: runtime.clone(),
                command: command.clone(),
            },
        )),
        TransportEntry::Http { url } => {
            Arc::new(HttpClient::new(entry.name.clone(), url.clone()))
        }
        TransportEntry::Peer { url } => {
            Arc::new(PeerAgentClient::new(entry.name.clone(), url.clone()))
        }
    }
}
