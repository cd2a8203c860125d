//! Gateway configuration and the stack file.
//!
//! The stack file (YAML) declares the southbound servers by transport kind
//! and the agent ACL bindings. Runtime knobs (ports, timeouts, workflow
//! bounds) live in [`GatewayConfig`] with defaults a laptop deployment can
//! run unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::acl::ToolSelector;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    pub log: String,
    /// Path advertised in the SSE `endpoint` event.
    pub message_path: String,
    pub session_max_age: Duration,
    pub session_sweep_interval: Duration,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub max_parallel: usize,
    pub max_depth: usize,
    pub deadline: Duration,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            max_depth: 5,
            deadline: Duration::from_secs(600),
        }
    }
}

impl GatewayConfig {
    pub fn new(port: u16, data_dir: Option<PathBuf>, log: String) -> Self {
        Self {
            port,
            data_dir: data_dir.unwrap_or_else(default_data_dir),
            log,
            message_path: "/message".into(),
            session_max_age: Duration::from_secs(30 * 60),
            session_sweep_interval: Duration::from_secs(60),
            workflow: WorkflowConfig::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("meshd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        // $XDG_DATA_HOME/meshd or ~/.local/share/meshd
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("meshd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("meshd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("meshd");
        }
    }
    PathBuf::from(".meshd")
}

// ─── Stack file ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StackConfig {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
    #[serde(default)]
    pub agents: Vec<AgentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerEntry {
    pub name: String,
    #[serde(flatten)]
    pub transport: TransportEntry,
}

/// One southbound server, keyed by its transport kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportEntry {
    Process {
        command: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        workdir: Option<PathBuf>,
    },
    Remote {
        host: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        port: Option<u16>,
        #[serde(default)]
        identity_file: Option<PathBuf>,
        command: String,
    },
    Container {
        container: String,
        #[serde(default)]
        runtime: String,
        command: Vec<String>,
    },
    Http {
        url: String,
    },
    Peer {
        url: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentEntry {
    pub name: String,
    #[serde(default)]
    pub tools: Vec<ToolSelector>,
}

/// Load a stack file. A missing file is an empty stack — the gateway can
/// boot with nothing southbound and pick servers up later.
pub fn load_stack(path: &Path) -> Result<StackConfig> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(StackConfig::default());
        }
        Err(e) => return Err(e).with_context(|| format!("reading stack file {}", path.display())),
    };
    serde_yaml::from_str(&content)
        .with_context(|| format!("parsing stack file {}", path.display()))
}
