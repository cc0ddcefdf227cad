//! Shell command tool backed by the shell execution service.
//!
//! Confirmation is keyed by the command's root word: once the user answers
//! "always allow" for a root (e.g. `git`), further commands with the same
//! root skip confirmation for the rest of the session.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::confirmation::{ConfirmationOutcome, ToolCallConfirmationDetails};
use crate::core_types::{FunctionDeclaration, ToolErrorKind, ToolResult};
use crate::errors::CoreError;
use crate::exec::{OnShellOutput, ShellExecutionService};
use crate::tools::{validate_against_schema, Tool};

pub struct ShellTool {
    workspace_root: PathBuf,
    allowed_roots: Arc<Mutex<HashSet<String>>>,
    on_output: Option<OnShellOutput>,
}

impl ShellTool {
    pub const NAME: &'static str = "run_shell_command";

    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            allowed_roots: Arc::new(Mutex::new(HashSet::new())),
            on_output: None,
        }
    }

    /// Forward incremental output events to the given callback.
    pub fn with_output_callback(mut self, on_output: OnShellOutput) -> Self {
        self.on_output = Some(on_output);
        self
    }

    fn command_of(args: &Value) -> Option<&str> {
        args.get("command").and_then(|v| v.as_str())
    }

    fn root_command(command: &str) -> String {
        command
            .split_whitespace()
            .next()
            .unwrap_or("")
            .rsplit('/')
            .next()
            .unwrap_or("")
            .to_string()
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: Self::NAME.to_string(),
            description: "Executes a shell command in the workspace and returns stdout, \
                          stderr and the exit code."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "The command to execute"},
                    "description": {"type": "string", "description": "Why this command is being run"}
                },
                "required": ["command"]
            }),
        }
    }

    fn validate_params(&self, args: &Value) -> Option<String> {
        if let Some(message) = validate_against_schema(&self.declaration().parameters, args) {
            return Some(message);
        }
        let command = Self::command_of(args)?;
        if command.trim().is_empty() {
            return Some("command must not be empty".to_string());
        }
        if command.contains('\0') {
            return Some("command must not contain null bytes".to_string());
        }
        None
    }

    fn description(&self, args: &Value) -> String {
        Self::command_of(args).unwrap_or("?").to_string()
    }

    async fn should_confirm(&self, args: &Value) -> Option<ToolCallConfirmationDetails> {
        let command = Self::command_of(args)?;
        let root = Self::root_command(command);
        if self.allowed_roots.lock().unwrap().contains(&root) {
            return None;
        }
        Some(ToolCallConfirmationDetails::Execute {
            command: command.to_string(),
            root_command: root,
        })
    }

    fn apply_confirmation(&self, args: &Value, outcome: &ConfirmationOutcome) {
        if *outcome != ConfirmationOutcome::ProceedAlways {
            return;
        }
        if let Some(command) = Self::command_of(args) {
            let root = Self::root_command(command);
            if !root.is_empty() {
                self.allowed_roots.lock().unwrap().insert(root);
            }
        }
    }

    async fn execute(
        &self,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, CoreError> {
        let Some(command) = Self::command_of(&args) else {
            return Ok(ToolResult::failed(
                ToolErrorKind::InvalidParams,
                "missing 'command'",
            ));
        };

        let handle = ShellExecutionService::execute(
            command,
            &self.workspace_root,
            self.on_output.clone(),
            cancel.clone(),
        );
        let result = handle.result().await;

        if let Some(error) = result.error {
            return Ok(ToolResult::failed(ToolErrorKind::ExecutionFailure, error));
        }
        if result.aborted {
            return Ok(ToolResult::failed(
                ToolErrorKind::Cancelled,
                format!("Command '{}' was cancelled", command),
            ));
        }

        let exit_code = result.exit_code;
        let content = format!(
            "Command: {}\nExit code: {}\nStdout:\n{}\nStderr:\n{}",
            command,
            exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "(killed by signal)".to_string()),
            result.stdout,
            result.stderr
        );
        let display = match exit_code {
            Some(0) => format!("$ {}", command),
            Some(code) => format!("$ {} (exit {})", command, code),
            None => format!("$ {} (signalled)", command),
        };
        Ok(ToolResult::text(content, display))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_command_extraction() {
        assert_eq!(ShellTool::root_command("git status"), "git");
        assert_eq!(ShellTool::root_command("/usr/bin/env ls"), "env");
        assert_eq!(ShellTool::root_command(""), "");
    }

    #[tokio::test]
    async fn test_always_allow_is_keyed_by_root() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool::new(dir.path());
        let status = json!({"command": "git status"});
        let log = json!({"command": "git log"});
        let other = json!({"command": "cargo build"});

        assert!(tool.should_confirm(&status).await.is_some());
        tool.apply_confirmation(&status, &ConfirmationOutcome::ProceedAlways);
        assert!(tool.should_confirm(&log).await.is_none());
        assert!(tool.should_confirm(&other).await.is_some());
    }

    #[tokio::test]
    async fn test_executes_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ShellTool::new(dir.path());
        let cancel = CancellationToken::new();
        let result = tool
            .execute(json!({"command": "printf 'a'; exit 2"}), &cancel)
            .await
            .unwrap();
        // Non-zero exit is a reportable result, not an error.
        assert!(!result.is_error());
        assert!(result.return_display.contains("exit 2"));
    }

    #[tokio::test]
    async fn test_cancellation_reports_cancelled_kind() {
        let dir = tempfile::tempdir().unwrap();
        let tool = Arc::new(ShellTool::new(dir.path()));
        let cancel = CancellationToken::new();
        let args = json!({"command": "printf 'a'; sleep 30"});
        let task = {
            let tool = tool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { tool.execute(args, &cancel).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        cancel.cancel();
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.error.unwrap().kind, ToolErrorKind::Cancelled);
    }

    #[test]
    fn test_empty_command_fails_validation() {
        let tool = ShellTool::new("/tmp");
        assert!(tool.validate_params(&json!({"command": "  "})).is_some());
        assert!(tool.validate_params(&json!({})).is_some());
    }
}
