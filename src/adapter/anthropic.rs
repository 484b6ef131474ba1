//! Anthropic Messages API adapter.
//!
//! Handles the key differences from the OpenAI shape:
//! - System messages are a top-level `system` parameter, not part of `messages`.
//! - Content uses typed blocks: `[{"type": "text", "text": "..."}]`.
//! - Tool calls are `tool_use` content blocks; tool results are
//!   `tool_result` blocks inside a user turn.
//! - `max_tokens` is required, not optional.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::GatewayError;
use crate::keys::Secret;
use crate::types::response::{Choice, FinishReason, ResponseMessage, Usage};
use crate::types::{ChatRequest, ChatResponse, Message, MessageRole, ToolCall};
use crate::Result;

use super::{classify_status, send_wire, Capability, ProviderAdapter, WireRequest, WireResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

const CAPABILITIES: &[Capability] = &[
    Capability::Tools,
    Capability::SystemMessages,
    Capability::Streaming,
    Capability::Images,
];

/// Anthropic Messages API adapter.
pub struct AnthropicAdapter {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl AnthropicAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            name: "anthropic".to_string(),
            base_url: base_url.into(),
            client,
        }
    }

    /// Extract system text and convert the rest of the conversation.
    /// Anthropic requires system as a top-level param, not in the array.
    fn split_messages(messages: &[Message]) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<String> = Vec::new();
        let mut turns: Vec<Value> = Vec::new();

        for m in messages {
            match m.role {
                MessageRole::System => {
                    if let Some(text) = &m.content {
                        system_parts.push(text.clone());
                    }
                }
                MessageRole::Assistant => {
                    let mut blocks: Vec<Value> = Vec::new();
                    if let Some(text) = &m.content {
                        if !text.is_empty() {
                            blocks.push(json!({ "type": "text", "text": text }));
                        }
                    }
                    for call in &m.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.arguments,
                        }));
                    }
                    turns.push(json!({ "role": "assistant", "content": blocks }));
                }
                MessageRole::Tool => {
                    // Tool results are user-role tool_result blocks.
                    turns.push(json!({
                        "role": "user",
                        "content": [{
                            "type": "tool_result",
                            "tool_use_id": m.tool_call_id.clone().unwrap_or_default(),
                            "content": m.text(),
                        }],
                    }));
                }
                MessageRole::User => {
                    turns.push(json!({
                        "role": "user",
                        "content": [{ "type": "text", "text": m.text() }],
                    }));
                }
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, turns)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn prepare(&self, request: &ChatRequest, model: &str, key: &Secret) -> Result<WireRequest> {
        let (system, turns) = Self::split_messages(&request.messages());
        if turns.is_empty() {
            return Err(GatewayError::invalid_request(
                "Anthropic requires at least one non-system message",
            )
            .with_provider(self.name.clone()));
        }

        let params = &request.params;
        let mut body = json!({
            "model": model,
            "messages": turns,
            "max_tokens": params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        if let Some(sys) = system {
            body["system"] = Value::String(sys);
        }
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = params.top_p {
            body["top_p"] = json!(p);
        }
        if !params.stop.is_empty() {
            body["stop_sequences"] = json!(params.stop);
        }
        if let Some(tools) = &params.tools {
            if !tools.is_empty() {
                body["tools"] = Value::Array(
                    tools
                        .iter()
                        .map(|t| {
                            json!({
                                "name": t.function.name,
                                "description": t.function.description,
                                "input_schema": t.function.parameters.clone()
                                    .unwrap_or_else(|| json!({"type": "object"})),
                            })
                        })
                        .collect(),
                );
            }
        }
        if let Some(Value::Object(extra)) = params.extras_for(&self.name) {
            for (k, v) in extra {
                body[k.as_str()] = v.clone();
            }
        }

        Ok(WireRequest {
            method: "POST".to_string(),
            url: format!("{}/v1/messages", self.base_url),
            headers: vec![
                ("x-api-key".to_string(), key.expose().to_string()),
                ("anthropic-version".to_string(), API_VERSION.to_string()),
            ],
            body,
        })
    }

    async fn execute(
        &self,
        wire: &WireRequest,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<WireResponse> {
        send_wire(&self.client, &self.name, wire, deadline, cancel).await
    }

    fn parse(&self, wire: WireResponse) -> Result<ChatResponse> {
        if !(200..300).contains(&wire.status) {
            return Err(classify_status(&self.name, wire.status, &wire.body_str()));
        }

        let body: Value = serde_json::from_slice(&wire.body).map_err(|e| {
            GatewayError::upstream_malformed(format!("response is not JSON: {}", e))
                .with_provider(self.name.clone())
        })?;

        let blocks = body
            .get("content")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                GatewayError::upstream_malformed("response has no content array")
                    .with_provider(self.name.clone())
            })?;

        let mut text_parts: Vec<&str> = Vec::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        for block in blocks {
            match block.get("type").and_then(|t| t.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|t| t.as_str()) {
                        text_parts.push(t);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall {
                        id: block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        name: block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string(),
                        arguments: block.get("input").cloned().unwrap_or(Value::Null),
                    });
                }
                _ => {}
            }
        }

        let finish_reason = body
            .get("stop_reason")
            .and_then(|v| v.as_str())
            .map(FinishReason::from_wire)
            .unwrap_or(FinishReason::Stop);

        let usage = body.get("usage").map(|u| {
            let prompt = u["input_tokens"].as_u64().unwrap_or(0);
            let completion = u["output_tokens"].as_u64().unwrap_or(0);
            Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
            }
        });

        let content = if text_parts.is_empty() {
            None
        } else {
            Some(text_parts.concat())
        };

        Ok(ChatResponse {
            id: body
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            model: body
                .get("model")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            choices: vec![Choice {
                index: 0,
                finish_reason,
                message: ResponseMessage {
                    role: MessageRole::Assistant,
                    content,
                    tool_calls,
                },
            }],
            usage,
            raw: Some(body),
            meta: Default::default(),
        })
    }
}
