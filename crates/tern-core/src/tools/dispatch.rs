//! Tool dispatch pipeline: Requested → Validated → (Confirming) → Executing.
//!
//! Errors never escape this boundary as exceptions. A missing tool, bad
//! arguments, a denied confirmation, a cancellation, or a failing execution
//! all become a structured `ToolResult` so the model can see and react to
//! them. The only outcome that is not a result is a call parked for external
//! confirmation.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::confirmation::{ConfirmationHandler, ConfirmationOutcome, PendingConfirmation};
use crate::config::ApprovalMode;
use crate::core_types::{ToolCallRequest, ToolErrorKind, ToolResult};
use crate::errors::CoreError;
use crate::tools::{Tool, ToolRegistry};

#[derive(Debug)]
pub enum DispatchOutcome {
    /// The call ran (or failed) and produced a result.
    Completed(ToolResult),
    /// The call needs approval and no inline handler is configured; it is
    /// recorded until the caller resolves it.
    AwaitingConfirmation(PendingConfirmation),
}

/// Drive one tool call through the full pipeline.
pub async fn dispatch_tool_call(
    registry: &ToolRegistry,
    request: &ToolCallRequest,
    approval_mode: ApprovalMode,
    handler: Option<&Arc<dyn ConfirmationHandler>>,
    cancel: &CancellationToken,
) -> DispatchOutcome {
    let Some(tool) = registry.get_tool(&request.name) else {
        return DispatchOutcome::Completed(ToolResult::failed(
            ToolErrorKind::NotFound,
            format!("Tool '{}' is not registered", request.name),
        ));
    };

    if let Some(message) = tool.validate_params(&request.args) {
        return DispatchOutcome::Completed(ToolResult::failed(
            ToolErrorKind::InvalidParams,
            format!("Invalid arguments for '{}': {}", request.name, message),
        ));
    }

    match approval_mode {
        ApprovalMode::Allow => {}
        ApprovalMode::Deny => {
            if tool.should_confirm(&request.args).await.is_some() {
                log::info!("tool '{}' denied by approval mode", request.name);
                return DispatchOutcome::Completed(ToolResult::failed(
                    ToolErrorKind::Cancelled,
                    format!("Execution of '{}' denied by policy", request.name),
                ));
            }
        }
        ApprovalMode::Ask => {
            if let Some(details) = tool.should_confirm(&request.args).await {
                let Some(handler) = handler else {
                    return DispatchOutcome::AwaitingConfirmation(PendingConfirmation {
                        request: request.clone(),
                        details,
                    });
                };
                match handler.confirm(request, &details).await {
                    Ok(ConfirmationOutcome::Cancel) => {
                        log::info!("tool '{}' rejected by user", request.name);
                        return DispatchOutcome::Completed(ToolResult::failed(
                            ToolErrorKind::Cancelled,
                            format!("Execution of '{}' was not approved", request.name),
                        ));
                    }
                    Ok(outcome) => tool.apply_confirmation(&request.args, &outcome),
                    Err(e) => {
                        return DispatchOutcome::Completed(ToolResult::failed(
                            ToolErrorKind::ExecutionFailure,
                            format!("Confirmation for '{}' failed: {}", request.name, e),
                        ));
                    }
                }
            }
        }
    }

    DispatchOutcome::Completed(run_tool(tool.as_ref(), &request.name, request.args.clone(), cancel).await)
}

/// Execute a call whose confirmation was resolved externally.
pub async fn execute_resolved_call(
    registry: &ToolRegistry,
    pending: &PendingConfirmation,
    outcome: ConfirmationOutcome,
    cancel: &CancellationToken,
) -> ToolResult {
    let request = &pending.request;
    if outcome == ConfirmationOutcome::Cancel {
        return ToolResult::failed(
            ToolErrorKind::Cancelled,
            format!("Execution of '{}' was not approved", request.name),
        );
    }
    let Some(tool) = registry.get_tool(&request.name) else {
        return ToolResult::failed(
            ToolErrorKind::NotFound,
            format!("Tool '{}' is not registered", request.name),
        );
    };
    tool.apply_confirmation(&request.args, &outcome);
    run_tool(tool.as_ref(), &request.name, request.args.clone(), cancel).await
}

async fn run_tool(
    tool: &dyn Tool,
    name: &str,
    args: Value,
    cancel: &CancellationToken,
) -> ToolResult {
    if cancel.is_cancelled() {
        return ToolResult::failed(
            ToolErrorKind::Cancelled,
            format!("Execution of '{}' was cancelled", name),
        );
    }
    match tool.execute(args, cancel).await {
        Ok(result) => result,
        Err(CoreError::Cancelled) => ToolResult::failed(
            ToolErrorKind::Cancelled,
            format!("Execution of '{}' was cancelled", name),
        ),
        Err(e) => ToolResult::failed(
            ToolErrorKind::ExecutionFailure,
            format!("Tool '{}' failed: {}", name, e),
        ),
    }
}
