//! Fetch a URL and return its body for the model.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::confirmation::ToolCallConfirmationDetails;
use crate::core_types::{FunctionDeclaration, ToolErrorKind, ToolResult};
use crate::errors::CoreError;
use crate::tools::{validate_against_schema, Tool};

/// Body bytes kept from a fetched page.
const MAX_BODY_BYTES: usize = 100_000;

/// Cap the body at `MAX_BODY_BYTES`, cutting on a char boundary so a
/// multi-byte character straddling the cap cannot panic the truncation.
fn cap_body(body: &mut String) {
    if body.len() <= MAX_BODY_BYTES {
        return;
    }
    let mut cut = MAX_BODY_BYTES;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    body.truncate(cut);
    body.push_str("\n[truncated]");
}

pub struct WebFetchTool {
    client: reqwest::Client,
}

impl WebFetchTool {
    pub const NAME: &'static str = "web_fetch";

    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn url_of(args: &Value) -> Option<&str> {
        args.get("url").and_then(|v| v.as_str())
    }
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: Self::NAME.to_string(),
            description: "Fetches the content of an http(s) URL and returns the body text, \
                          truncated to a size cap."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "The URL to fetch"},
                    "prompt": {"type": "string", "description": "What to look for in the page"}
                },
                "required": ["url"]
            }),
        }
    }

    fn validate_params(&self, args: &Value) -> Option<String> {
        if let Some(message) = validate_against_schema(&self.declaration().parameters, args) {
            return Some(message);
        }
        let url = Self::url_of(args)?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Some(format!("url must be http(s): {}", url));
        }
        None
    }

    fn description(&self, args: &Value) -> String {
        format!("Fetch {}", Self::url_of(args).unwrap_or("?"))
    }

    async fn should_confirm(&self, args: &Value) -> Option<ToolCallConfirmationDetails> {
        let url = Self::url_of(args)?;
        Some(ToolCallConfirmationDetails::Info {
            prompt: format!("Fetch content from {}", url),
            urls: vec![url.to_string()],
        })
    }

    async fn execute(
        &self,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, CoreError> {
        let Some(url) = Self::url_of(&args) else {
            return Ok(ToolResult::failed(
                ToolErrorKind::InvalidParams,
                "missing 'url'",
            ));
        };

        let response = tokio::select! {
            sent = self.client.get(url).send() => match sent {
                Ok(response) => response,
                Err(e) => {
                    return Ok(ToolResult::failed(
                        ToolErrorKind::ExecutionFailure,
                        format!("fetch of {} failed: {}", url, e),
                    ));
                }
            },
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        let status = response.status();
        let body = tokio::select! {
            text = response.text() => text.unwrap_or_default(),
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        if !status.is_success() {
            return Ok(ToolResult::failed(
                ToolErrorKind::ExecutionFailure,
                format!("fetch of {} returned status {}", url, status),
            ));
        }

        let mut body = body;
        cap_body(&mut body);
        Ok(ToolResult::text(
            body,
            format!("Fetched {} ({})", url, status),
        ))
    }
}
