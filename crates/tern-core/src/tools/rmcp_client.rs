//! rmcp-backed MCP client with stdio and SSE transports
//!
//! One transport is active per provider: a configured command spawns a local
//! subprocess speaking the protocol over its stdio, a configured URL connects
//! to a streamed HTTP endpoint. The connection is held for as long as tools
//! discovered from it remain registered.

use async_trait::async_trait;
use rmcp::{
    model::{CallToolRequestParam, RawContent, ResourceContents},
    service::{DynService, RunningService, ServiceExt},
    transport::sse_client::{SseClientConfig, SseClientTransport},
    transport::TokioChildProcess,
    RoleClient,
};
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::mcp_client::{McpClient, McpToolInfo};
use crate::config::{McpCommand, McpServerConfig};
use crate::errors::CoreError;

const LIST_TOOLS_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
const RESPONSE_CHAR_LIMIT: usize = 25_000;

type ClientService = RunningService<RoleClient, Box<dyn DynService<RoleClient>>>;

pub struct RmcpClient {
    service: Mutex<Option<ClientService>>,
    server_name: String,
}

impl RmcpClient {
    /// Connect to one provider, selecting the transport from its config.
    pub async fn connect(config: &McpServerConfig) -> Result<Self, CoreError> {
        let service = match (&config.url, &config.command) {
            (Some(url), _) => Self::serve_sse(&config.name, url).await?,
            (None, Some(command)) => Self::serve_stdio(&config.name, command).await?,
            (None, None) => {
                return Err(CoreError::Config(format!(
                    "provider '{}' has neither a url nor a command",
                    config.name
                )));
            }
        };
        log::info!("connected to MCP server '{}'", config.name);
        Ok(Self {
            service: Mutex::new(Some(service)),
            server_name: config.name.clone(),
        })
    }

    async fn serve_stdio(name: &str, command: &McpCommand) -> Result<ClientService, CoreError> {
        log::info!(
            "starting MCP server '{}' with command: {} {:?}",
            name,
            command.run,
            command.args
        );
        let mut cmd = Command::new(&command.run);
        cmd.args(&command.args);
        if let Some(working_dir) = &command.working_dir {
            cmd.current_dir(working_dir);
        }
        cmd.env_clear();
        cmd.envs(std::env::vars());
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let transport = TokioChildProcess::new(cmd).map_err(|e| CoreError::ProviderConnection {
            provider: name.to_string(),
            message: format!("failed to spawn transport: {}", e),
        })?;
        let handler: Box<dyn DynService<RoleClient>> = Box::new(());
        handler
            .serve(transport)
            .await
            .map_err(|e| CoreError::ProviderConnection {
                provider: name.to_string(),
                message: format!("handshake failed: {}", e),
            })
    }

    async fn serve_sse(name: &str, url: &str) -> Result<ClientService, CoreError> {
        log::info!("connecting to MCP server '{}' at {}", name, url);
        let config = SseClientConfig {
            sse_endpoint: url.into(),
            ..Default::default()
        };
        let transport = SseClientTransport::start_with_client(reqwest::Client::default(), config)
            .await
            .map_err(|e| CoreError::ProviderConnection {
                provider: name.to_string(),
                message: format!("SSE connect to {} failed: {}", url, e),
            })?;
        let handler: Box<dyn DynService<RoleClient>> = Box::new(());
        handler
            .serve(transport)
            .await
            .map_err(|e| CoreError::ProviderConnection {
                provider: name.to_string(),
                message: format!("handshake failed: {}", e),
            })
    }

    fn render_content(&self, tool_name: &str, content: &[rmcp::model::Content]) -> String {
        if content.is_empty() {
            return "Tool executed successfully (no content returned)".to_string();
        }
        let mut text = String::new();
        for item in content {
            match &item.raw {
                RawContent::Text(text_content) => text.push_str(&text_content.text),
                RawContent::Image(image) => {
                    text.push_str(&format!(
                        "Image ({}, {} bytes)",
                        image.mime_type,
                        image.data.len()
                    ));
                }
                RawContent::Resource(resource) => {
                    let uri = match &resource.resource {
                        ResourceContents::TextResourceContents { uri, .. } => uri,
                        ResourceContents::BlobResourceContents { uri, .. } => uri,
                    };
                    text.push_str(&format!("Resource: {}", uri));
                }
                RawContent::Audio(audio) => {
                    text.push_str(&format!(
                        "Audio ({}, {} bytes)",
                        audio.mime_type,
                        audio.data.len()
                    ));
                }
            }
            text.push('\n');
        }
        if text.len() > RESPONSE_CHAR_LIMIT {
            log::warn!(
                "truncating response from tool '{}' ({} bytes)",
                tool_name,
                text.len()
            );
            let mut cut = RESPONSE_CHAR_LIMIT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str(" [...TRUNCATED...]");
        }
        text
    }
}

#[async_trait]
impl McpClient for RmcpClient {
    async fn list_tools(&self) -> Result<Vec<McpToolInfo>, CoreError> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| CoreError::ProviderConnection {
            provider: self.server_name.clone(),
            message: "not connected".to_string(),
        })?;

        let response = tokio::time::timeout(LIST_TOOLS_TIMEOUT, service.list_tools(Default::default()))
            .await
            .map_err(|_| CoreError::ProviderConnection {
                provider: self.server_name.clone(),
                message: "timed out waiting for the tool listing".to_string(),
            })?
            .map_err(|e| CoreError::ProviderConnection {
                provider: self.server_name.clone(),
                message: format!("list_tools failed: {}", e),
            })?;

        let mut tools = Vec::new();
        for tool in &response.tools {
            let raw = serde_json::json!({
                "name": tool.name.as_ref(),
                "description": tool.description.as_ref().map(|d| d.as_ref()).unwrap_or(""),
                "inputSchema": Value::Object(tool.input_schema.as_ref().clone()),
            });
            match McpToolInfo::decode(&raw) {
                Ok(info) => tools.push(info),
                Err(e) => log::warn!(
                    "skipping malformed declaration from '{}': {}",
                    self.server_name,
                    e
                ),
            }
        }
        log::debug!(
            "listed {} tools from MCP server '{}'",
            tools.len(),
            self.server_name
        );
        Ok(tools)
    }

    async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<String, CoreError> {
        let guard = self.service.lock().await;
        let service = guard.as_ref().ok_or_else(|| CoreError::ProviderConnection {
            provider: self.server_name.clone(),
            message: "not connected".to_string(),
        })?;

        let arguments = if arguments.is_null() {
            None
        } else {
            arguments.as_object().cloned()
        };
        let request = CallToolRequestParam {
            name: tool_name.to_string().into(),
            arguments,
        };

        let result = service.call_tool(request).await.map_err(|e| {
            CoreError::ExecutionFailure(format!(
                "call to '{}' on '{}' failed: {}",
                tool_name, self.server_name, e
            ))
        })?;

        Ok(self.render_content(tool_name, &result.content))
    }

    async fn is_connected(&self) -> bool {
        self.service.lock().await.is_some()
    }

    async fn close(&self) {
        if let Some(service) = self.service.lock().await.take() {
            if let Err(e) = service.cancel().await {
                log::warn!("failed to close MCP server '{}': {}", self.server_name, e);
            } else {
                log::info!("closed connection to MCP server '{}'", self.server_name);
            }
        }
    }
}

impl Drop for RmcpClient {
    fn drop(&mut self) {
        // Best-effort teardown when close() was never called.
        if let Ok(mut guard) = self.service.try_lock() {
            if let Some(service) = guard.take() {
                tokio::spawn(async move {
                    if let Err(e) = service.cancel().await {
                        log::warn!("failed to cancel MCP service during drop: {}", e);
                    }
                });
            }
        }
    }
}
