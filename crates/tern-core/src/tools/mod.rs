//! Tool system for extending the model with locally executable capabilities
//!
//! Every tool implements the same invocation lifecycle: validate the request
//! arguments, describe the call, decide whether it needs confirmation, then
//! execute under a cancellation signal. Tools are registered in a
//! `ToolRegistry` keyed by a globally unique name; built-ins register at
//! session start and remote-discovered tools are added by the discovery
//! client with deterministic collision resolution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::confirmation::{ConfirmationOutcome, ToolCallConfirmationDetails};
use crate::core_types::{FunctionDeclaration, ToolResult};
use crate::errors::CoreError;

pub mod discovery;
pub mod dispatch;
pub mod mcp_client;
pub mod read_file;
pub mod rmcp_client;
pub mod shell;
pub mod web_fetch;
pub mod write_file;

pub use discovery::{discover_mcp_tools, DiscoveredTool};
pub use dispatch::{dispatch_tool_call, DispatchOutcome};
pub use mcp_client::{McpClient, McpToolInfo};
pub use read_file::ReadFileTool;
pub use rmcp_client::RmcpClient;
pub use shell::ShellTool;
pub use web_fetch::WebFetchTool;
pub use write_file::WriteFileTool;

/// Maximum length of a registered tool name.
pub const MAX_TOOL_NAME_LENGTH: usize = 63;

/// Core trait all tools implement. The lifecycle per call is
/// validate → describe → confirm → execute; `execute` is only reached after
/// validation succeeded and any required confirmation was granted.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Immutable schema advertised to the model and used for validation.
    fn declaration(&self) -> FunctionDeclaration;

    /// Structural/semantic check of the arguments. Returns an error string
    /// or `None`; no side effects.
    fn validate_params(&self, args: &Value) -> Option<String>;

    /// Short human-oriented description of what this call will do.
    fn description(&self, args: &Value) -> String;

    /// `None` when no confirmation is needed (including when an earlier
    /// "always allow" grant covers this call).
    async fn should_confirm(&self, args: &Value) -> Option<ToolCallConfirmationDetails>;

    /// Applies a confirmation outcome to the tool's trust state. This is the
    /// only path that flips persistent grants such as auto-accepted edits or
    /// allowlisted command roots.
    fn apply_confirmation(&self, _args: &Value, _outcome: &ConfirmationOutcome) {}

    /// Performs the effect. Long-running tools must observe the cancellation
    /// signal and terminate promptly.
    async fn execute(&self, args: Value, cancel: &CancellationToken)
        -> Result<ToolResult, CoreError>;

    /// Owning remote server, for discovered tools.
    fn server_name(&self) -> Option<&str> {
        None
    }
}

/// Validate `args` against a JSON-schema-shaped parameter schema.
/// Returns the joined validation errors, or `None` when the args conform.
pub fn validate_against_schema(schema: &Value, args: &Value) -> Option<String> {
    let compiled = match jsonschema::JSONSchema::compile(schema) {
        Ok(compiled) => compiled,
        Err(e) => return Some(format!("invalid parameter schema: {}", e)),
    };
    let errors: Vec<String> = match compiled.validate(args) {
        Ok(()) => return None,
        Err(errors) => errors.map(|e| e.to_string()).collect(),
    };
    Some(errors.join("; "))
}

/// Replace characters outside `[a-zA-Z0-9_.-]` with underscores.
pub fn sanitize_tool_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Enforce the 63-character cap by keeping a fixed-length head and tail
/// joined by a separator, so truncated names stay distinguishable.
pub fn enforce_name_length(name: &str) -> String {
    if name.len() <= MAX_TOOL_NAME_LENGTH {
        return name.to_string();
    }
    let head = &name[..28];
    let tail = &name[name.len() - 32..];
    format!("{}___{}", head, tail)
}

/// Name→Tool lookup aggregating built-ins and remote-discovered tools.
/// Registration is additive; lookups may interleave with registration.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its declared name. A second registration under
    /// the same name is logged and ignored rather than overwriting.
    pub fn register_tool(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.declaration().name;
        if self.tools.contains_key(&name) {
            log::warn!("ignoring duplicate tool registration for '{}'", name);
            return;
        }
        self.tools.insert(name, tool);
    }

    /// Resolve a unique registry name for a discovered tool: sanitize, prefix
    /// with the server name on collision, then cap the length. Deterministic
    /// given the already-registered state.
    pub fn resolve_discovered_name(&self, server_name: &str, remote_name: &str) -> String {
        let sanitized = sanitize_tool_name(remote_name);
        let candidate = if self.tools.contains_key(&sanitized) {
            format!("{}__{}", sanitize_tool_name(server_name), sanitized)
        } else {
            sanitized
        };
        enforce_name_length(&candidate)
    }

    pub fn get_tool(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tools contributed by one remote server. Used after discovery to decide
    /// whether a just-connected server contributed anything.
    pub fn tools_by_server(&self, server_name: &str) -> Vec<Arc<dyn Tool>> {
        self.tools
            .values()
            .filter(|tool| tool.server_name() == Some(server_name))
            .cloned()
            .collect()
    }

    /// Drop every tool contributed by one server, keeping declarations and
    /// lookups consistent after a disconnect.
    pub fn remove_server_tools(&mut self, server_name: &str) {
        self.tools
            .retain(|_, tool| tool.server_name() != Some(server_name));
    }

    /// Schema set advertised to the model; reflects only currently
    /// registered tools.
    pub fn function_declarations(&self) -> Vec<FunctionDeclaration> {
        self.tools.values().map(|tool| tool.declaration()).collect()
    }

    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::StubTool;
    use super::*;
    use regex::Regex;

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(Arc::new(StubTool::named("read_file")));
        assert_eq!(registry.tool_count(), 1);
        assert!(registry.get_tool("read_file").is_some());
        assert!(registry.get_tool("missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_is_ignored_not_overwritten() {
        let mut registry = ToolRegistry::new();
        let mut first = StubTool::named("search");
        first.result = ToolResult::text("first", "first");
        registry.register_tool(Arc::new(first));
        registry.register_tool(Arc::new(StubTool::named("search")));
        assert_eq!(registry.tool_count(), 1);
    }

    #[test]
    fn test_collision_resolution_prefixes_server_name() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(Arc::new(StubTool::named("search")));
        let resolved = registry.resolve_discovered_name("providerB", "search");
        assert_eq!(resolved, "providerB__search");
        // No collision: the sanitized remote name is kept as-is.
        assert_eq!(registry.resolve_discovered_name("providerB", "lookup"), "lookup");
    }

    #[test]
    fn test_resolution_is_deterministic_and_idempotent() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(Arc::new(StubTool::named("search")));
        let a = registry.resolve_discovered_name("srv", "search");
        let b = registry.resolve_discovered_name("srv", "search");
        assert_eq!(a, b);
    }

    #[test]
    fn test_name_length_invariant() {
        let long = "a".repeat(40) + &"b".repeat(40);
        let capped = enforce_name_length(&long);
        assert_eq!(capped.len(), MAX_TOOL_NAME_LENGTH);
        assert!(capped.starts_with(&"a".repeat(28)));
        assert!(capped.ends_with(&"b".repeat(32)));
        assert!(capped.contains("___"));

        let pattern = Regex::new(r"^[a-zA-Z0-9_.-]+$").unwrap();
        let sanitized = sanitize_tool_name("weird name!with:chars");
        assert!(pattern.is_match(&sanitized));
        assert!(pattern.is_match(&enforce_name_length(&long)));
    }

    #[test]
    fn test_declarations_track_registered_tools() {
        let mut registry = ToolRegistry::new();
        registry.register_tool(Arc::new(StubTool::named("one")));
        registry.register_tool(Arc::new(StubTool::named("two")));
        let mut names: Vec<String> = registry
            .function_declarations()
            .into_iter()
            .map(|d| d.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["one".to_string(), "two".to_string()]);
    }

    #[test]
    fn test_schema_validation_reports_errors() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        });
        assert!(validate_against_schema(&schema, &serde_json::json!({"path": "/a"})).is_none());
        assert!(validate_against_schema(&schema, &serde_json::json!({})).is_some());
        assert!(validate_against_schema(&schema, &serde_json::json!({"path": 7})).is_some());
    }
}
