//! Model endpoint abstractions.
//!
//! Defines the `ModelClient` trait implemented by concrete providers. Clients
//! produce a bounded channel of streamed deltas per request; the turn layer
//! translates those into events. A convenience `generate` collects a full
//! response for cheap auxiliary calls such as the next-speaker check.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core_types::{FunctionDeclaration, Message};
use crate::errors::CoreError;

pub mod gemini;

pub use gemini::GeminiClient;

/// One delta of streamed model output.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Text(String),
    Thought(String),
    FunctionCall {
        id: Option<String>,
        name: String,
        args: Value,
    },
    Finished(Option<String>),
}

/// A fully collected (non-streamed) model response.
#[derive(Debug, Clone, Default)]
pub struct CollectedResponse {
    pub text: String,
    pub function_calls: Vec<(Option<String>, String, Value)>,
    pub finish_reason: Option<String>,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Start one streamed exchange. The returned receiver yields deltas in
    /// the order the model streams them and closes when the stream ends.
    /// Errors during iteration arrive in-band; a raised cancellation token
    /// closes the stream promptly with `CoreError::Cancelled`.
    async fn generate_stream(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[FunctionDeclaration],
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<Result<StreamDelta, CoreError>>, CoreError>;

    /// Run one exchange to completion and collect the output. Used for cheap
    /// auxiliary calls where streaming adds nothing.
    async fn generate(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[FunctionDeclaration],
        cancel: &CancellationToken,
    ) -> Result<CollectedResponse, CoreError> {
        let mut rx = self.generate_stream(model, messages, tools, cancel).await?;
        let mut collected = CollectedResponse::default();
        while let Some(delta) = rx.recv().await {
            match delta? {
                StreamDelta::Text(text) => collected.text.push_str(&text),
                StreamDelta::Thought(_) => {}
                StreamDelta::FunctionCall { id, name, args } => {
                    collected.function_calls.push((id, name, args));
                }
                StreamDelta::Finished(reason) => collected.finish_reason = reason,
            }
        }
        Ok(collected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ScriptedClient {
        deltas: Vec<StreamDelta>,
    }

    #[async_trait]
    impl ModelClient for ScriptedClient {
        async fn generate_stream(
            &self,
            _model: &str,
            _messages: &[Message],
            _tools: &[FunctionDeclaration],
            _cancel: &CancellationToken,
        ) -> Result<mpsc::Receiver<Result<StreamDelta, CoreError>>, CoreError> {
            let (tx, rx) = mpsc::channel(16);
            let deltas = self.deltas.clone();
            tokio::spawn(async move {
                for delta in deltas {
                    if tx.send(Ok(delta)).await.is_err() {
                        break;
                    }
                }
            });
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_generate_collects_stream_in_order() {
        let client = ScriptedClient {
            deltas: vec![
                StreamDelta::Text("Hello ".to_string()),
                StreamDelta::Thought("pondering".to_string()),
                StreamDelta::Text("world".to_string()),
                StreamDelta::FunctionCall {
                    id: None,
                    name: "read_file".to_string(),
                    args: serde_json::json!({"path": "/tmp/a"}),
                },
                StreamDelta::Finished(Some("STOP".to_string())),
            ],
        };
        let cancel = CancellationToken::new();
        let collected = client
            .generate("tern-default", &[], &[], &cancel)
            .await
            .unwrap();
        assert_eq!(collected.text, "Hello world");
        assert_eq!(collected.function_calls.len(), 1);
        assert_eq!(collected.function_calls[0].1, "read_file");
        assert_eq!(collected.finish_reason.as_deref(), Some("STOP"));
    }
}
