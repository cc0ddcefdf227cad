//! Error types for failure handling across the orchestration engine
//!
//! This module provides a unified error hierarchy that captures all failure
//! modes in a session. Errors are categorized by their source (model endpoint,
//! tools, remote providers, configuration) so that callers can apply targeted
//! recovery: a 429 triggers a model fallback, a provider failure is isolated
//! to that provider, and a cancellation is never folded into generic failure.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Tool not found: {0}")]
    ToolNotFound(String),
    #[error("Tool execution failed: {0}")]
    ExecutionFailure(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Model API request failed with status {status} (model '{model}', {duration_ms}ms): {message}")]
    Api {
        status: u16,
        message: String,
        model: String,
        duration_ms: u64,
    },
    #[error("Provider '{provider}' connection failed: {message}")]
    ProviderConnection { provider: String, message: String },
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Session initialization failed: {0}")]
    Initialization(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl CoreError {
    /// True when the error is the recoverable user/timeout cancellation
    /// condition rather than a real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }

    /// Status code attached to a model endpoint failure, if any.
    pub fn api_status(&self) -> Option<u16> {
        match self {
            CoreError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_status_accessor() {
        let err = CoreError::Api {
            status: 429,
            message: "quota".to_string(),
            model: "tern-default".to_string(),
            duration_ms: 12,
        };
        assert_eq!(err.api_status(), Some(429));
        assert!(!err.is_cancelled());
        assert_eq!(CoreError::Cancelled.api_status(), None);
        assert!(CoreError::Cancelled.is_cancelled());
    }
}
