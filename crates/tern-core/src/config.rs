//! Session and provider configuration types.
//!
//! Configuration is supplied by an external settings collaborator and is
//! read-only from the core's perspective. This module only defines the shapes;
//! loading them from disk is out of scope.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

fn default_mcp_timeout() -> u64 {
    30
}

/// How tool executions are gated before running.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Ask the confirmation collaborator before any tool with side effects.
    #[default]
    Ask,
    /// Execute every tool without confirmation.
    Allow,
    /// Deny every tool that would require confirmation.
    Deny,
}

/// Command used to spawn a local MCP server speaking the protocol over stdio.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpCommand {
    pub run: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// One remote tool provider. A `url` selects the streamed HTTP transport,
/// a `command` the stdio subprocess transport; exactly one must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(default)]
    pub command: Option<McpCommand>,
    #[serde(default)]
    pub url: Option<String>,
    /// Per-call timeout for tools from this provider, in seconds.
    #[serde(default = "default_mcp_timeout")]
    pub timeout: u64,
    /// Trusted providers skip tool-call confirmation.
    #[serde(default)]
    pub trust: bool,
}

impl McpServerConfig {
    pub fn stdio(name: impl Into<String>, command: McpCommand) -> Self {
        Self {
            name: name.into(),
            command: Some(command),
            url: None,
            timeout: default_mcp_timeout(),
            trust: false,
        }
    }

    pub fn sse(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: None,
            url: Some(url.into()),
            timeout: default_mcp_timeout(),
            trust: false,
        }
    }
}

/// Settings for one conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Model used for every request until a quota failure forces a fallback.
    pub model: String,
    /// Cheaper model switched to for the rest of the session on a 429.
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub approval_mode: ApprovalMode,
    /// Root directory tools are confined to.
    pub workspace_root: PathBuf,
    /// Extra context appended to the environment preamble, e.g. a
    /// full-file-context dump assembled by the caller.
    #[serde(default)]
    pub extra_context: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
}

impl SessionConfig {
    pub fn new(model: impl Into<String>, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            fallback_model: None,
            approval_mode: ApprovalMode::default(),
            workspace_root: workspace_root.into(),
            extra_context: None,
            mcp_servers: Vec::new(),
        }
    }

    pub fn with_fallback_model(mut self, model: impl Into<String>) -> Self {
        self.fallback_model = Some(model.into());
        self
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }
}
