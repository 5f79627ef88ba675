//! One-shot, network-isolated container runs and the identity registry the
//! callback proxy authenticates against.

pub mod engine;
pub mod identity;
pub mod orchestrator;

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use toolhub_error::HubError;

pub use engine::{ContainerEngine, DockerCli, EngineOutput};
pub use identity::{ContainerRegistry, ContainerSession};
pub use orchestrator::{
    ContainerRunResult, ContainerState, CreateContainerParams, NetworkMode, SandboxOrchestrator,
};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("container engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("failed to prepare build context: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn into_hub_error(self, tool: &str) -> HubError {
        match self {
            SandboxError::InvalidRequest(message) => HubError::InvalidArguments {
                tool: tool.to_string(),
                message,
            },
            SandboxError::EngineUnavailable(message) => HubError::EngineUnavailable { message },
            SandboxError::Io(err) => HubError::ToolFailed {
                tool: tool.to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSettings {
    /// Container engine CLI.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Parent directory for build contexts; the system temp dir when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_root: Option<PathBuf>,
    #[serde(default = "default_memory")]
    pub default_memory: String,
    #[serde(default = "default_cpus")]
    pub default_cpus: String,
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_build_timeout_ms")]
    pub build_timeout_ms: u64,
    #[serde(default = "default_user")]
    pub user: String,
    /// Whether `bridge` networking (the only route to the callback proxy) is allowed.
    #[serde(default)]
    pub allow_bridge: bool,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            work_root: None,
            default_memory: default_memory(),
            default_cpus: default_cpus(),
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            build_timeout_ms: default_build_timeout_ms(),
            user: default_user(),
            allow_bridge: false,
        }
    }
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_memory() -> String {
    "512m".to_string()
}

fn default_cpus() -> String {
    "1".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_build_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_user() -> String {
    "nobody".to_string()
}
