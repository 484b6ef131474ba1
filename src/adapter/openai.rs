//! OpenAI-compatible chat completions adapter.
//!
//! Works for OpenAI itself and the many providers that mirror its chat
//! completions shape. Tool-call arguments travel as JSON-encoded strings
//! on the wire; this adapter decodes them into structured values.

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

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

const CAPABILITIES: &[Capability] = &[
    Capability::Tools,
    Capability::SystemMessages,
    Capability::Streaming,
    Capability::Images,
];

/// OpenAI chat completions adapter.
pub struct OpenAiAdapter {
    name: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAiAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_base_url(client, DEFAULT_BASE_URL)
    }

    /// Custom base URL, for OpenAI-compatible providers and mock servers.
    pub fn with_base_url(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            name: "openai".to_string(),
            base_url: base_url.into(),
            client,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn wire_message(m: &Message) -> Value {
        let mut obj = json!({ "role": m.role.as_str() });
        if let Some(content) = &m.content {
            obj["content"] = Value::String(content.clone());
        } else {
            // The API requires the field even when a turn is tool-calls-only.
            obj["content"] = Value::Null;
        }
        if let Some(id) = &m.tool_call_id {
            obj["tool_call_id"] = Value::String(id.clone());
        }
        if !m.tool_calls.is_empty() {
            obj["tool_calls"] = Value::Array(
                m.tool_calls
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "type": "function",
                            "function": {
                                "name": c.name,
                                "arguments": c.arguments.to_string(),
                            },
                        })
                    })
                    .collect(),
            );
        }
        obj
    }

    fn parse_tool_calls(message: &Value) -> Vec<ToolCall> {
        message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .filter_map(|c| {
                        let id = c.get("id")?.as_str()?.to_string();
                        let name = c.pointer("/function/name")?.as_str()?.to_string();
                        let raw_args = c
                            .pointer("/function/arguments")
                            .and_then(|a| a.as_str())
                            .unwrap_or("{}");
                        // Arguments arrive JSON-encoded; keep the raw string
                        // if the model produced something unparsable.
                        let arguments = serde_json::from_str(raw_args)
                            .unwrap_or_else(|_| Value::String(raw_args.to_string()));
                        Some(ToolCall { id, name, arguments })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        CAPABILITIES
    }

    fn prepare(&self, request: &ChatRequest, model: &str, key: &Secret) -> Result<WireRequest> {
        let messages: Vec<Value> = request.messages().iter().map(Self::wire_message).collect();

        let mut body = json!({
            "model": model,
            "messages": messages,
        });

        let params = &request.params;
        if let Some(t) = params.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(p) = params.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(mt) = params.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if !params.stop.is_empty() {
            body["stop"] = json!(params.stop);
        }
        if let Some(tools) = &params.tools {
            if !tools.is_empty() {
                body["tools"] = serde_json::to_value(tools)?;
                if let Some(choice) = &params.tool_choice {
                    body["tool_choice"] = choice.clone();
                }
            }
        }
        if let Some(Value::Object(extra)) = params.extras_for(&self.name) {
            for (k, v) in extra {
                body[k.as_str()] = v.clone();
            }
        }

        Ok(WireRequest {
            method: "POST".to_string(),
            url: format!("{}/chat/completions", self.base_url),
            headers: vec![(
                "authorization".to_string(),
                format!("Bearer {}", key.expose()),
            )],
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

        let choices = body
            .get("choices")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                GatewayError::upstream_malformed("response has no choices array")
                    .with_provider(self.name.clone())
            })?
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let message = c.get("message").cloned().unwrap_or(Value::Null);
                let tool_calls = Self::parse_tool_calls(&message);
                let finish_reason = c
                    .get("finish_reason")
                    .and_then(|v| v.as_str())
                    .map(FinishReason::from_wire)
                    .unwrap_or(if tool_calls.is_empty() {
                        FinishReason::Stop
                    } else {
                        FinishReason::ToolCalls
                    });
                Choice {
                    index: c.get("index").and_then(|v| v.as_u64()).unwrap_or(i as u64) as u32,
                    finish_reason,
                    message: ResponseMessage {
                        role: MessageRole::Assistant,
                        content: message
                            .get("content")
                            .and_then(|v| v.as_str())
                            .map(String::from),
                        tool_calls,
                    },
                }
            })
            .collect();

        let usage = body.get("usage").map(|u| Usage {
            prompt_tokens: u["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: u["completion_tokens"].as_u64().unwrap_or(0),
            total_tokens: u["total_tokens"].as_u64().unwrap_or(0),
        });

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
            choices,
            usage,
            raw: Some(body),
            meta: Default::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn adapter() -> OpenAiAdapter {
        OpenAiAdapter::new(reqwest::Client::new())
    }

    #[test]
    fn test_prepare_basic_request() {
        let req = ChatRequest::chat("gpt-4o", vec![Message::user("ping")]);
        let wire = adapter()
            .prepare(&req, "gpt-4o", &Secret::new("sk-test"))
            .unwrap();
        assert!(wire.url.ends_with("/chat/completions"));
        assert_eq!(wire.body["model"], "gpt-4o");
        assert_eq!(wire.body["messages"][0]["content"], "ping");
        assert_eq!(wire.headers[0].1, "Bearer sk-test");
    }

    #[test]
    fn test_prepare_serializes_tool_history() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "lookup".into(),
            arguments: json!({"q": "6*7"}),
        };
        let req = ChatRequest::chat(
            "gpt-4o",
            vec![
                Message::user("what is 6*7?"),
                Message::assistant_tool_calls(None, vec![call]),
                Message::tool("call_1", "42"),
            ],
        );
        let wire = adapter()
            .prepare(&req, "gpt-4o", &Secret::new("k"))
            .unwrap();
        let msgs = wire.body["messages"].as_array().unwrap();
        assert_eq!(msgs[1]["tool_calls"][0]["function"]["name"], "lookup");
        // Arguments must be JSON-encoded strings on the wire.
        assert!(msgs[1]["tool_calls"][0]["function"]["arguments"].is_string());
        assert_eq!(msgs[2]["role"], "tool");
        assert_eq!(msgs[2]["tool_call_id"], "call_1");
    }

    #[test]
    fn test_prepare_merges_provider_extras() {
        let mut req = ChatRequest::chat("gpt-4o", vec![Message::user("hi")]);
        req.params
            .extras
            .insert("openai".into(), json!({"logprobs": true}));
        req.params
            .extras
            .insert("anthropic".into(), json!({"top_k": 5}));
        let wire = adapter()
            .prepare(&req, "gpt-4o", &Secret::new("k"))
            .unwrap();
        assert_eq!(wire.body["logprobs"], true);
        assert!(wire.body.get("top_k").is_none());
    }

    #[test]
    fn test_parse_success() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "pong"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        });
        let resp = adapter()
            .parse(WireResponse {
                status: 200,
                body: serde_json::to_vec(&body).unwrap().into(),
            })
            .unwrap();
        assert_eq!(resp.first_content(), Some("pong"));
        assert_eq!(resp.usage.unwrap().total_tokens, 4);
        assert_eq!(resp.choices[0].finish_reason, FinishReason::Stop);
    }

    #[test]
    fn test_parse_tool_calls_decodes_arguments() {
        let body = json!({
            "id": "chatcmpl-2",
            "model": "gpt-4o",
            "choices": [{"index": 0, "finish_reason": "tool_calls", "message": {
                "role": "assistant",
                "content": null,
                "tool_calls": [{"id": "call_9", "type": "function",
                    "function": {"name": "lookup", "arguments": "{\"q\":\"answer\"}"}}]
            }}]
        });
        let resp = adapter()
            .parse(WireResponse {
                status: 200,
                body: serde_json::to_vec(&body).unwrap().into(),
            })
            .unwrap();
        assert!(resp.has_tool_calls());
        assert_eq!(resp.tool_calls()[0].arguments["q"], "answer");
        assert_eq!(resp.choices[0].finish_reason, FinishReason::ToolCalls);
    }

    #[test]
    fn test_parse_error_status_is_classified() {
        let err = adapter()
            .parse(WireResponse {
                status: 429,
                body: Bytes::from_static(b"{\"error\": {\"message\": \"slow down\"}}"),
            })
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::RateLimited);
        assert_eq!(err.status, Some(429));
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        let err = adapter()
            .parse(WireResponse {
                status: 200,
                body: Bytes::from_static(b"not json"),
            })
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::UpstreamMalformed);
    }
}
