//! One streamed model exchange.
//!
//! A turn owns a single request/response cycle against the model endpoint:
//! it forwards streamed deltas as events, assembles the model message for the
//! history, and collects the tool calls the model requested. Every collected
//! request carries a non-empty `call_id`; when the model omits one, the turn
//! mints it from the tool name and a fresh UUID.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core_types::{FunctionDeclaration, Message, Part, Role, ToolCallRequest};
use crate::errors::CoreError;
use crate::llm::{ModelClient, StreamDelta};

/// Event emitted while a turn streams.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A chunk of visible model text.
    Content(String),
    /// A chunk of model reasoning, shown but never fed back into history.
    Thought(String),
    /// The model requested a tool invocation.
    ToolCallRequest(ToolCallRequest),
    /// The stream ended, with the model's finish reason if it gave one.
    Finished(Option<String>),
}

pub struct Turn {
    prompt_id: String,
    parts: Vec<Part>,
    pending_tool_calls: Vec<ToolCallRequest>,
    finish_reason: Option<String>,
}

impl Turn {
    pub fn new(prompt_id: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            parts: Vec::new(),
            pending_tool_calls: Vec::new(),
            finish_reason: None,
        }
    }

    /// Tool calls the model requested during this turn, in stream order.
    pub fn pending_tool_calls(&self) -> &[ToolCallRequest] {
        &self.pending_tool_calls
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// The model message to append to history, or `None` when the model
    /// produced nothing (e.g. the stream was cancelled before any content).
    pub fn model_message(&self) -> Option<Message> {
        if self.parts.is_empty() {
            return None;
        }
        Some(Message {
            role: Role::Model,
            parts: self.parts.clone(),
        })
    }

    /// Run the exchange to completion, forwarding events as they stream.
    /// A raised cancellation surfaces as `Err(CoreError::Cancelled)`; the
    /// turn's collected state up to that point stays valid.
    pub async fn run(
        &mut self,
        client: &dyn ModelClient,
        model: &str,
        messages: &[Message],
        tools: &[FunctionDeclaration],
        events: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), CoreError> {
        let mut rx = client.generate_stream(model, messages, tools, cancel).await?;
        let mut text_buffer = String::new();

        while let Some(delta) = rx.recv().await {
            let delta = match delta {
                Ok(delta) => delta,
                Err(e) => {
                    // Keep whatever streamed before the failure.
                    self.flush_text(&mut text_buffer);
                    return Err(e);
                }
            };
            match delta {
                StreamDelta::Text(text) => {
                    text_buffer.push_str(&text);
                    let _ = events.send(TurnEvent::Content(text)).await;
                }
                StreamDelta::Thought(text) => {
                    let _ = events.send(TurnEvent::Thought(text)).await;
                }
                StreamDelta::FunctionCall { id, name, args } => {
                    self.flush_text(&mut text_buffer);
                    let request = self.make_request(id, name, args);
                    self.parts.push(Part::FunctionCall {
                        id: Some(request.call_id.clone()),
                        name: request.name.clone(),
                        args: request.args.clone(),
                    });
                    self.pending_tool_calls.push(request.clone());
                    let _ = events.send(TurnEvent::ToolCallRequest(request)).await;
                }
                StreamDelta::Finished(reason) => {
                    self.finish_reason = reason;
                }
            }
        }

        self.flush_text(&mut text_buffer);
        let _ = events
            .send(TurnEvent::Finished(self.finish_reason.clone()))
            .await;
        Ok(())
    }

    fn flush_text(&mut self, buffer: &mut String) {
        if !buffer.is_empty() {
            self.parts.push(Part::text(std::mem::take(buffer)));
        }
    }

    fn make_request(&self, id: Option<String>, name: String, args: Value) -> ToolCallRequest {
        let call_id = match id {
            Some(id) if !id.is_empty() => id,
            _ => format!("{}-{}", name, Uuid::new_v4()),
        };
        ToolCallRequest {
            call_id,
            name,
            args,
            prompt_id: self.prompt_id.clone(),
        }
    }
}
