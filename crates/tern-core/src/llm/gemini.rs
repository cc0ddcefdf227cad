//! Google Gemini API client implementation
//!
//! Native client for Google's Generative AI endpoints. Requests go to the
//! streaming endpoint (`:streamGenerateContent?alt=sse`) and the SSE body is
//! translated into `StreamDelta`s as chunks arrive. Endpoint failures carry
//! the HTTP status, request duration, and model tag for observability; the
//! session layer uses the 429 status to switch to a fallback model.

use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::core_types::{FunctionDeclaration, Message, Part, Role};
use crate::errors::CoreError;
use crate::llm::{ModelClient, StreamDelta};

const STREAM_CHANNEL_CAPACITY: usize = 64;

pub struct GeminiClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            client: Client::new(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        }
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        Self {
            api_key,
            client: Client::new(),
            base_url,
        }
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: GeminiInlineData,
    },
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        thought: Option<bool>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiInlineData {
    #[serde(rename = "mimeType")]
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetails {
    code: u16,
    message: String,
}

fn convert_messages(messages: &[Message]) -> Vec<GeminiContent> {
    messages
        .iter()
        .map(|message| GeminiContent {
            role: Some(
                match message.role {
                    Role::User => "user",
                    Role::Model => "model",
                }
                .to_string(),
            ),
            parts: message.parts.iter().map(convert_part).collect(),
        })
        .collect()
}

fn convert_part(part: &Part) -> GeminiPart {
    match part {
        Part::Text { text } => GeminiPart::Text {
            text: text.clone(),
            thought: None,
        },
        Part::Thought { text } => GeminiPart::Text {
            text: text.clone(),
            thought: Some(true),
        },
        Part::InlineData { mime_type, data } => GeminiPart::InlineData {
            inline_data: GeminiInlineData {
                mime_type: mime_type.clone(),
                data: data.clone(),
            },
        },
        Part::FunctionCall { name, args, .. } => GeminiPart::FunctionCall {
            function_call: GeminiFunctionCall {
                name: name.clone(),
                args: args.clone(),
            },
        },
        Part::FunctionResponse { name, response, .. } => GeminiPart::FunctionResponse {
            function_response: GeminiFunctionResponse {
                name: name.clone(),
                response: response.clone(),
            },
        },
    }
}

fn convert_tools(tools: &[FunctionDeclaration]) -> Option<Vec<GeminiTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(vec![GeminiTool {
        function_declarations: tools
            .iter()
            .map(|tool| GeminiFunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            })
            .collect(),
    }])
}

/// Translate one parsed SSE chunk into deltas.
fn chunk_to_deltas(chunk: GeminiStreamChunk) -> Vec<StreamDelta> {
    let mut deltas = Vec::new();
    for candidate in chunk.candidates {
        if let Some(content) = candidate.content {
            for part in content.parts {
                match part {
                    GeminiPart::Text { text, thought } => {
                        if thought.unwrap_or(false) {
                            deltas.push(StreamDelta::Thought(text));
                        } else {
                            deltas.push(StreamDelta::Text(text));
                        }
                    }
                    GeminiPart::FunctionCall { function_call } => {
                        deltas.push(StreamDelta::FunctionCall {
                            id: None,
                            name: function_call.name,
                            args: function_call.args,
                        });
                    }
                    // Responses and blobs never appear in model output.
                    GeminiPart::FunctionResponse { .. } | GeminiPart::InlineData { .. } => {}
                }
            }
        }
        if let Some(reason) = candidate.finish_reason {
            deltas.push(StreamDelta::Finished(Some(reason)));
        }
    }
    deltas
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn generate_stream(
        &self,
        model: &str,
        messages: &[Message],
        tools: &[FunctionDeclaration],
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<Result<StreamDelta, CoreError>>, CoreError> {
        let request = GeminiRequest {
            contents: convert_messages(messages),
            tools: convert_tools(tools),
        };

        let url = format!(
            "{}/models/{}:streamGenerateContent?alt=sse&key={}",
            self.base_url, model, self.api_key
        );

        let started = Instant::now();
        let response = tokio::select! {
            sent = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&request)
                .send() => sent.map_err(|e| CoreError::Api {
                    status: 0,
                    message: format!("request failed: {}", e),
                    model: model.to_string(),
                    duration_ms: started.elapsed().as_millis() as u64,
                })?,
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
        };

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = match serde_json::from_str::<GeminiError>(&error_text) {
                Ok(parsed) => format!("{} ({})", parsed.error.message, parsed.error.code),
                Err(_) => error_text,
            };
            return Err(CoreError::Api {
                status,
                message,
                model: model.to_string(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        let cancel = cancel.clone();
        let model = model.to_string();
        tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            loop {
                let chunk = tokio::select! {
                    next = body.next() => next,
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(CoreError::Cancelled)).await;
                        return;
                    }
                };
                let chunk = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        let _ = tx
                            .send(Err(CoreError::MalformedResponse(format!(
                                "stream read failed for model '{}': {}",
                                model, e
                            ))))
                            .await;
                        return;
                    }
                    None => break,
                };
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are newline-delimited `data:` lines.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload.is_empty() || payload == "[DONE]" {
                        continue;
                    }
                    match serde_json::from_str::<GeminiStreamChunk>(payload) {
                        Ok(parsed) => {
                            for delta in chunk_to_deltas(parsed) {
                                if tx.send(Ok(delta)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            log::warn!("skipping malformed stream chunk: {}", e);
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_conversion_roles_and_parts() {
        let messages = vec![
            Message::user_text("hello"),
            Message {
                role: Role::Model,
                parts: vec![Part::FunctionCall {
                    id: Some("c1".to_string()),
                    name: "read_file".to_string(),
                    args: json!({"path": "/tmp/a"}),
                }],
            },
        ];
        let contents = convert_messages(&messages);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[0].role.as_deref(), Some("user"));
        assert_eq!(contents[1].role.as_deref(), Some("model"));
        match &contents[1].parts[0] {
            GeminiPart::FunctionCall { function_call } => {
                assert_eq!(function_call.name, "read_file");
            }
            other => panic!("expected function call part, got {:?}", other),
        }
    }

    #[test]
    fn test_chunk_to_deltas_splits_text_and_calls() {
        let chunk: GeminiStreamChunk = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [
                        {"text": "thinking...", "thought": true},
                        {"text": "Listing files now."},
                        {"functionCall": {"name": "run_shell_command", "args": {"command": "ls"}}}
                    ]
                },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();
        let deltas = chunk_to_deltas(chunk);
        assert_eq!(deltas.len(), 4);
        assert_eq!(deltas[0], StreamDelta::Thought("thinking...".to_string()));
        assert_eq!(deltas[1], StreamDelta::Text("Listing files now.".to_string()));
        match &deltas[2] {
            StreamDelta::FunctionCall { name, args, .. } => {
                assert_eq!(name, "run_shell_command");
                assert_eq!(args["command"], "ls");
            }
            other => panic!("expected function call delta, got {:?}", other),
        }
        assert_eq!(deltas[3], StreamDelta::Finished(Some("STOP".to_string())));
    }

    #[test]
    fn test_empty_tool_list_is_omitted() {
        assert!(convert_tools(&[]).is_none());
        let tools = convert_tools(&[FunctionDeclaration {
            name: "web_fetch".to_string(),
            description: "Fetch a URL".to_string(),
            parameters: json!({"type": "object"}),
        }])
        .unwrap();
        assert_eq!(tools[0].function_declarations.len(), 1);
    }
}
