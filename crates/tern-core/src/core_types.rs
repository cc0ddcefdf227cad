//! Core type definitions for the conversation/tool-execution protocol
//!
//! This module defines the data structures that form the contract between the
//! conversation driver, turns, and tools. Messages follow the part-based
//! layout of the upstream model API: a message is an ordered list of parts,
//! where each part is either plain text, inline binary data, a function call
//! requested by the model, the paired function response, or a thought marker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// One segment of a message. Tagged union mirroring the model API's content
/// parts; inline data is carried base64-encoded as the wire does.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        mime_type: String,
        data: String,
    },
    FunctionCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        args: Value,
    },
    FunctionResponse {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        name: String,
        response: Value,
    },
    Thought {
        text: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            parts: vec![Part::text(text)],
        }
    }

    pub fn model_text(text: impl Into<String>) -> Self {
        Message {
            role: Role::Model,
            parts: vec![Part::text(text)],
        }
    }
}

/// A tool invocation requested by the model during a turn. The `call_id` must
/// be echoed back in exactly one corresponding function response before the
/// next model call is made.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub args: Value,
    pub prompt_id: String,
}

/// Schema advertised to the model for one registered tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ToolErrorKind {
    NotFound,
    InvalidParams,
    ExecutionFailure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

/// Outcome of one tool call. `llm_content` is fed back to the model;
/// `return_display` is the human-oriented summary. Immutable once produced.
/// Failures are carried in `error` so the model can see and react to them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResult {
    pub llm_content: Vec<Part>,
    pub return_display: String,
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn text(content: impl Into<String>, display: impl Into<String>) -> Self {
        ToolResult {
            llm_content: vec![Part::text(content)],
            return_display: display.into(),
            error: None,
        }
    }

    pub fn failed(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        ToolResult {
            llm_content: vec![Part::text(format!("Error: {}", message))],
            return_display: message.clone(),
            error: Some(ToolError { kind, message }),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The `functionResponse` part that pairs this result with its request.
    pub fn into_function_response(self, call_id: &str, tool_name: &str) -> Part {
        let response = match &self.error {
            Some(err) => serde_json::json!({ "error": err.message }),
            None => {
                let text: String = self
                    .llm_content
                    .iter()
                    .filter_map(|p| match p {
                        Part::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                serde_json::json!({ "output": text })
            }
        };
        Part::FunctionResponse {
            id: Some(call_id.to_string()),
            name: tool_name.to_string(),
            response,
        }
    }
}
