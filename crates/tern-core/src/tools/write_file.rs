//! Write a file inside the workspace, gated by an edit confirmation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::confirmation::{ConfirmationOutcome, ToolCallConfirmationDetails};
use crate::core_types::{FunctionDeclaration, ToolErrorKind, ToolResult};
use crate::errors::CoreError;
use crate::tools::{validate_against_schema, Tool};

pub struct WriteFileTool {
    workspace_root: PathBuf,
    /// "Always accept edits" session memory; once set, confirmations for
    /// edits short-circuit for the rest of the session.
    auto_accept_edits: Arc<AtomicBool>,
}

impl WriteFileTool {
    pub const NAME: &'static str = "write_file";

    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            auto_accept_edits: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn auto_accept_flag(&self) -> Arc<AtomicBool> {
        self.auto_accept_edits.clone()
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

/// Minimal line diff between the current and proposed content, enough for an
/// approver to judge the edit.
fn render_diff(old: &str, new: &str) -> String {
    let mut out = String::new();
    for line in old.lines() {
        out.push_str("- ");
        out.push_str(line);
        out.push('\n');
    }
    for line in new.lines() {
        out.push_str("+ ");
        out.push_str(line);
        out.push('\n');
    }
    out
}

#[async_trait]
impl Tool for WriteFileTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: Self::NAME.to_string(),
            description: "Writes content to a file in the workspace, replacing any existing \
                          content. The path must be absolute."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Absolute path to the file"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
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
        format!("Write {}", path)
    }

    async fn should_confirm(&self, args: &Value) -> Option<ToolCallConfirmationDetails> {
        if self.auto_accept_edits.load(Ordering::Relaxed) {
            return None;
        }
        let path = self.check_path(args).ok()?;
        let new_content = args.get("content").and_then(|v| v.as_str())?;
        let old_content = tokio::fs::read_to_string(&path).await.unwrap_or_default();
        Some(ToolCallConfirmationDetails::Edit {
            path: path.display().to_string(),
            diff: render_diff(&old_content, new_content),
        })
    }

    fn apply_confirmation(&self, _args: &Value, outcome: &ConfirmationOutcome) {
        if *outcome == ConfirmationOutcome::ProceedAlways {
            self.auto_accept_edits.store(true, Ordering::Relaxed);
        }
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
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return Ok(ToolResult::failed(
                    ToolErrorKind::ExecutionFailure,
                    format!("failed to create {}: {}", parent.display(), e),
                ));
            }
        }
        if let Err(e) = tokio::fs::write(&path, content).await {
            return Ok(ToolResult::failed(
                ToolErrorKind::ExecutionFailure,
                format!("failed to write {}: {}", path.display(), e),
            ));
        }

        let summary = format!("Wrote {} bytes to {}", content.len(), path.display());
        Ok(ToolResult::text(summary.clone(), summary))
    }
}
