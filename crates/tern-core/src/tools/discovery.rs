//! Remote tool discovery over MCP.
//!
//! Configured providers are connected and listed concurrently, but failures
//! stay isolated per provider and registration happens sequentially in
//! configuration order so registry names come out the same on every run.
//! A provider that contributes no tools has its connection closed instead of
//! being kept idle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::mcp_client::{McpClient, McpToolInfo};
use super::rmcp_client::RmcpClient;
use super::{validate_against_schema, Tool, ToolRegistry};
use crate::config::McpServerConfig;
use crate::confirmation::ToolCallConfirmationDetails;
use crate::core_types::{FunctionDeclaration, ToolErrorKind, ToolResult};
use crate::errors::CoreError;

/// A remote tool registered into the local registry. Holds the connection it
/// was discovered over; calls are proxied to the provider under the
/// provider's timeout.
pub struct DiscoveredTool {
    client: Arc<dyn McpClient>,
    server_name: String,
    /// Name this tool is registered under locally (post collision resolution).
    registered_name: String,
    /// Name the provider knows the tool by.
    remote_name: String,
    description: String,
    input_schema: Value,
    timeout: Duration,
    trusted: bool,
}

impl DiscoveredTool {
    pub fn new(
        client: Arc<dyn McpClient>,
        server_name: impl Into<String>,
        registered_name: impl Into<String>,
        info: &McpToolInfo,
        timeout: Duration,
        trusted: bool,
    ) -> Self {
        Self {
            client,
            server_name: server_name.into(),
            registered_name: registered_name.into(),
            remote_name: info.name.clone(),
            description: info.description.clone(),
            input_schema: info.input_schema.clone(),
            timeout,
            trusted,
        }
    }
}

#[async_trait]
impl Tool for DiscoveredTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.registered_name.clone(),
            description: if self.description.is_empty() {
                format!("Tool '{}' from server '{}'", self.remote_name, self.server_name)
            } else {
                self.description.clone()
            },
            parameters: self.input_schema.clone(),
        }
    }

    fn validate_params(&self, args: &Value) -> Option<String> {
        validate_against_schema(&self.input_schema, args)
    }

    fn description(&self, _args: &Value) -> String {
        format!("{} ({})", self.remote_name, self.server_name)
    }

    async fn should_confirm(&self, _args: &Value) -> Option<ToolCallConfirmationDetails> {
        if self.trusted {
            return None;
        }
        Some(ToolCallConfirmationDetails::Info {
            prompt: format!(
                "Call tool '{}' on MCP server '{}'",
                self.remote_name, self.server_name
            ),
            urls: Vec::new(),
        })
    }

    async fn execute(
        &self,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, CoreError> {
        let call = self.client.call_tool(&self.remote_name, args);
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(self.timeout, call) => outcome,
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };
        match outcome {
            Ok(Ok(content)) => Ok(ToolResult::text(
                content,
                format!("{} via {}", self.remote_name, self.server_name),
            )),
            Ok(Err(e)) => Ok(ToolResult::failed(
                ToolErrorKind::ExecutionFailure,
                e.to_string(),
            )),
            Err(_) => Ok(ToolResult::failed(
                ToolErrorKind::ExecutionFailure,
                format!(
                    "call to '{}' on '{}' timed out after {:?}",
                    self.remote_name, self.server_name, self.timeout
                ),
            )),
        }
    }

    fn server_name(&self) -> Option<&str> {
        Some(&self.server_name)
    }
}

/// Connect to every configured provider, list its tools, and register them.
/// Returns the number of tools registered across all providers.
pub async fn discover_mcp_tools(
    registry: &mut ToolRegistry,
    configs: &[McpServerConfig],
) -> usize {
    let listings = join_all(configs.iter().map(|config| async move {
        let client = RmcpClient::connect(config).await?;
        let client: Arc<dyn McpClient> = Arc::new(client);
        let tools = client.list_tools().await?;
        Ok::<_, CoreError>((client, tools))
    }))
    .await;

    let mut registered = 0;
    for (config, listing) in configs.iter().zip(listings) {
        match listing {
            Ok((client, tools)) => {
                registered +=
                    register_provider_tools(registry, config, client.clone(), &tools).await;
            }
            Err(e) => {
                // One bad provider must not sink the rest of the fan-out.
                log::error!("MCP server '{}' skipped: {}", config.name, e);
            }
        }
    }
    registered
}

/// Register one provider's listed tools. The connection is closed when the
/// provider contributed nothing.
pub async fn register_provider_tools(
    registry: &mut ToolRegistry,
    config: &McpServerConfig,
    client: Arc<dyn McpClient>,
    tools: &[McpToolInfo],
) -> usize {
    let timeout = Duration::from_secs(config.timeout);
    let mut registered = 0;
    for info in tools {
        let name = registry.resolve_discovered_name(&config.name, &info.name);
        registry.register_tool(Arc::new(DiscoveredTool::new(
            client.clone(),
            config.name.clone(),
            name,
            info,
            timeout,
            config.trust,
        )));
        registered += 1;
    }
    if registered == 0 {
        log::info!(
            "MCP server '{}' exposed no usable tools, closing connection",
            config.name
        );
        client.close().await;
    } else {
        log::info!(
            "registered {} tools from MCP server '{}'",
            registered,
            config.name
        );
    }
    registered
}
