//! Tool execution confirmation for controlled side effects
//!
//! Tool calls with side effects are intercepted before execution and routed
//! to an external approver. The approver sees enough data to decide (a diff,
//! a command, the URLs to be fetched) and answers once per call. Approvals
//! are plain data: a call awaiting approval is held as a durable
//! `PendingConfirmation` record on the session until an explicit resolve call
//! supplies the outcome, so pending state stays inspectable without UI code.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core_types::ToolCallRequest;
use crate::errors::CoreError;

/// Answer from the approver for one tool call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConfirmationOutcome {
    /// Execute this call only.
    ProceedOnce,
    /// Execute this call and remember the grant for similar calls
    /// (per-tool meaning: same root command, any edit, same server).
    ProceedAlways,
    /// Do not execute; the call is reported as cancelled.
    Cancel,
}

/// Data shown to the approver, tagged by the kind of side effect.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolCallConfirmationDetails {
    Edit {
        path: String,
        diff: String,
    },
    Execute {
        command: String,
        root_command: String,
    },
    Info {
        prompt: String,
        #[serde(default)]
        urls: Vec<String>,
    },
}

/// A tool call parked until the caller resolves it. Created when a
/// confirmation is needed but no inline handler is configured.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub request: ToolCallRequest,
    pub details: ToolCallConfirmationDetails,
}

/// External confirmation collaborator. When configured on a session,
/// confirmations are resolved inline instead of parking the call.
#[async_trait]
pub trait ConfirmationHandler: Send + Sync {
    async fn confirm(
        &self,
        request: &ToolCallRequest,
        details: &ToolCallConfirmationDetails,
    ) -> Result<ConfirmationOutcome, CoreError>;
}

/// Handler that always answers with a fixed outcome (for tests and for
/// non-interactive deployments that run fully trusted).
#[derive(Debug, Clone)]
pub struct StaticConfirmationHandler {
    outcome: ConfirmationOutcome,
}

impl StaticConfirmationHandler {
    pub fn new(outcome: ConfirmationOutcome) -> Self {
        Self { outcome }
    }

    pub fn always_proceed() -> Self {
        Self::new(ConfirmationOutcome::ProceedOnce)
    }

    pub fn always_cancel() -> Self {
        Self::new(ConfirmationOutcome::Cancel)
    }
}

#[async_trait]
impl ConfirmationHandler for StaticConfirmationHandler {
    async fn confirm(
        &self,
        _request: &ToolCallRequest,
        _details: &ToolCallConfirmationDetails,
    ) -> Result<ConfirmationOutcome, CoreError> {
        Ok(self.outcome)
    }
}

#[cfg(test)]
pub(crate) struct SequenceConfirmationHandler {
    outcomes: std::sync::Mutex<Vec<ConfirmationOutcome>>,
}

#[cfg(test)]
impl SequenceConfirmationHandler {
    pub fn new(mut outcomes: Vec<ConfirmationOutcome>) -> Self {
        outcomes.reverse();
        Self {
            outcomes: std::sync::Mutex::new(outcomes),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ConfirmationHandler for SequenceConfirmationHandler {
    async fn confirm(
        &self,
        _request: &ToolCallRequest,
        _details: &ToolCallConfirmationDetails,
    ) -> Result<ConfirmationOutcome, CoreError> {
        Ok(self
            .outcomes
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(ConfirmationOutcome::ProceedOnce))
    }
}
