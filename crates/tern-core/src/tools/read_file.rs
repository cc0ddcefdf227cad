//! Read a file from the workspace.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::confirmation::ToolCallConfirmationDetails;
use crate::core_types::{FunctionDeclaration, ToolErrorKind, ToolResult};
use crate::errors::CoreError;
use crate::tools::{validate_against_schema, Tool};

const MAX_LINES_DEFAULT: usize = 2000;

pub struct ReadFileTool {
    workspace_root: PathBuf,
}

impl ReadFileTool {
    pub const NAME: &'static str = "read_file";

    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }

    fn check_path(&self, args: &Value) -> Result<PathBuf, String> {
        let path = args
            .get("path")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing 'path'".to_string())?;
        let path = Path::new(path);
        if !path.is_absolute() {
            return Err(format!("path must be absolute: {}", path.display()));
        }
        if !path.starts_with(&self.workspace_root) {
            return Err(format!(
                "path must be inside the workspace root ({})",
                self.workspace_root.display()
            ));
        }
        Ok(path.to_path_buf())
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: Self::NAME.to_string(),
            description: "Reads a text file from the workspace. The path must be absolute. \
                          Optionally reads a window of lines via offset/limit."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute path to the file"},
                    "offset": {"type": "integer", "minimum": 0},
                    "limit": {"type": "integer", "minimum": 1}
                },
                "required": ["path"]
            }),
        }
    }

    fn validate_params(&self, args: &Value) -> Option<String> {
        if let Some(message) = validate_against_schema(&self.declaration().parameters, args) {
            return Some(message);
        }
        self.check_path(args).err()
    }

    fn description(&self, args: &Value) -> String {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("?");
        format!("Read {}", path)
    }

    async fn should_confirm(&self, _args: &Value) -> Option<ToolCallConfirmationDetails> {
        None
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: &CancellationToken,
    ) -> Result<ToolResult, CoreError> {
        let path = match self.check_path(&args) {
            Ok(path) => path,
            Err(message) => {
                return Ok(ToolResult::failed(ToolErrorKind::InvalidParams, message))
            }
        };

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return Ok(ToolResult::failed(
                    ToolErrorKind::ExecutionFailure,
                    format!("failed to read {}: {}", path.display(), e),
                ));
            }
        };
        if bytes.contains(&0u8) {
            return Ok(ToolResult::failed(
                ToolErrorKind::ExecutionFailure,
                format!("{} appears to be a binary file", path.display()),
            ));
        }
        let content = String::from_utf8_lossy(&bytes);

        let offset = args.get("offset").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(MAX_LINES_DEFAULT);

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let window: Vec<&str> = lines.into_iter().skip(offset).take(limit).collect();
        let truncated = offset + window.len() < total;

        let mut text = window.join("\n");
        if truncated {
            text.push_str(&format!(
                "\n[truncated: showing lines {}-{} of {}]",
                offset + 1,
                offset + window.len(),
                total
            ));
        }

        Ok(ToolResult::text(
            text,
            format!("Read {} ({} lines)", path.display(), total),
        ))
    }
}
