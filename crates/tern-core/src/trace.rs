//! Telemetry hooks for session activity.
//!
//! A trait for handling structured call/response/error events. This allows
//! decoupled monitoring or logging without modifying the core loop; the
//! session calls the sink but never depends on its result.

use crate::core_types::{ToolCallRequest, ToolResult};
use crate::errors::CoreError;

pub trait TraceHandler: Send + Sync {
    /// Called when a tool call has been requested by the model.
    fn on_tool_call(&self, _request: &ToolCallRequest) {}

    /// Called once a tool call has resolved to a result (success or failure).
    fn on_tool_result(&self, _call_id: &str, _result: &ToolResult) {}

    /// Called when a model endpoint request fails.
    fn on_api_error(&self, _error: &CoreError) {}

    /// Called after each completed turn.
    fn on_turn_complete(&self, _turn_index: usize) {}
}

/// Sink that forwards everything to the `log` facade.
#[derive(Debug, Default)]
pub struct LogTraceHandler;

impl TraceHandler for LogTraceHandler {
    fn on_tool_call(&self, request: &ToolCallRequest) {
        log::info!(
            "tool call requested: {} ({})",
            request.name,
            request.call_id
        );
    }

    fn on_tool_result(&self, call_id: &str, result: &ToolResult) {
        match &result.error {
            Some(err) => log::warn!("tool call {} failed: {}", call_id, err.message),
            None => log::info!("tool call {} succeeded", call_id),
        }
    }

    fn on_api_error(&self, error: &CoreError) {
        log::error!("model API error: {}", error);
    }

    fn on_turn_complete(&self, turn_index: usize) {
        log::debug!("turn {} complete", turn_index);
    }
}
