//! Model Context Protocol (MCP) client abstraction for remote tool providers
//!
//! The discovery client and the discovered tools talk to providers through
//! this trait so transports stay interchangeable and discovery is testable
//! without spawning servers. Remote tool declarations are decoded into
//! `McpToolInfo` at this boundary; anything malformed is rejected before it
//! can reach the registry.

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::CoreError;

/// A remote tool declaration, decoded and validated.
#[derive(Debug, Clone)]
pub struct McpToolInfo {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl McpToolInfo {
    /// Decode an untyped declaration. The name must be non-empty and the
    /// schema, when present, must be a JSON object.
    pub fn decode(raw: &Value) -> Result<Self, CoreError> {
        let name = raw
            .get("name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                CoreError::MalformedResponse("tool declaration is missing a name".to_string())
            })?;
        let input_schema = match raw.get("inputSchema").or_else(|| raw.get("input_schema")) {
            None => serde_json::json!({"type": "object"}),
            Some(schema) if schema.is_object() => schema.clone(),
            Some(other) => {
                return Err(CoreError::MalformedResponse(format!(
                    "tool '{}' has a non-object input schema: {}",
                    name, other
                )));
            }
        };
        Ok(McpToolInfo {
            name: name.to_string(),
            description: raw
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            input_schema,
        })
    }
}

#[async_trait]
pub trait McpClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, CoreError>;
    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<String, CoreError>;
    async fn is_connected(&self) -> bool;
    /// Tear down the transport. Idempotent.
    async fn close(&self);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Scripted client for discovery tests.
    pub struct MockMcpClient {
        pub tools: Vec<McpToolInfo>,
        pub fail_listing: bool,
        pub closed: AtomicBool,
    }

    impl MockMcpClient {
        pub fn with_tools(tools: Vec<McpToolInfo>) -> Self {
            Self {
                tools,
                fail_listing: false,
                closed: AtomicBool::new(false),
            }
        }

        pub fn failing() -> Self {
            Self {
                tools: Vec::new(),
                fail_listing: true,
                closed: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl McpClient for MockMcpClient {
        async fn list_tools(&self) -> Result<Vec<McpToolInfo>, CoreError> {
            if self.fail_listing {
                return Err(CoreError::ProviderConnection {
                    provider: "mock".to_string(),
                    message: "listing failed".to_string(),
                });
            }
            Ok(self.tools.clone())
        }

        async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<String, CoreError> {
            Ok(format!("mock result from {} ({})", tool_name, arguments))
        }

        async fn is_connected(&self) -> bool {
            !self.closed.load(Ordering::Relaxed)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }
    }
}
