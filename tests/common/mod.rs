//! Shared scaffolding for engine integration tests: a scriptable mock
//! adapter and an in-memory tool source, so no test touches the network.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use ai_gateway_rust::adapter::{Capability, WireRequest, WireResponse};
use ai_gateway_rust::tools::ToolDescriptor;
use ai_gateway_rust::{
    CancelToken, ChatRequest, ChatResponse, FinishReason, GatewayError, MessageRole,
    ProviderAdapter, Result, ToolCall, ToolOutcome, ToolSource,
};
use ai_gateway_rust::keys::Secret;
use ai_gateway_rust::types::response::{Choice, ResponseMessage, Usage};

const ALL_CAPABILITIES: &[Capability] = &[
    Capability::Tools,
    Capability::SystemMessages,
    Capability::Streaming,
    Capability::Images,
];

/// One scripted upstream behavior, consumed per execute call.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// 200 with this assistant text.
    Reply(String),
    /// 200 with these tool calls: (id, name, arguments).
    ToolCalls(Vec<(String, String, Value)>),
    /// Upstream HTTP status with a body.
    Status(u16, String),
    /// Block for this long (observing cancel/deadline), then reply.
    Hang(Duration, String),
    /// Transient transport failure surfaced from execute.
    NetworkError,
}

/// Scriptable in-memory provider adapter.
///
/// Behaviors pop off the script in execute order; an empty script falls
/// back to the default behavior.
pub struct MockAdapter {
    name: String,
    script: Mutex<VecDeque<Behavior>>,
    default: Behavior,
    executes: AtomicU32,
    last_request: Mutex<Option<ChatRequest>>,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            default: Behavior::Reply("ok".into()),
            executes: AtomicU32::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn with_default(mut self, behavior: Behavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn push(&self, behavior: Behavior) {
        self.script.lock().unwrap().push_back(behavior);
    }

    /// Number of execute calls observed (includes worker retries).
    pub fn executes(&self) -> u32 {
        self.executes.load(Ordering::SeqCst)
    }

    /// The request snapshot most recently seen by prepare.
    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn next_behavior(&self) -> Behavior {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }

    fn reply_body(&self, model: &str, text: &str) -> Value {
        json!({
            "id": format!("mock-{}", self.executes()),
            "model": model,
            "content": text,
            "finish_reason": "stop",
        })
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        ALL_CAPABILITIES
    }

    fn prepare(&self, request: &ChatRequest, model: &str, _key: &Secret) -> Result<WireRequest> {
        *self.last_request.lock().unwrap() = Some(request.clone());
        Ok(WireRequest {
            method: "POST".to_string(),
            url: format!("mock://{}", self.name),
            headers: Vec::new(),
            body: json!({ "model": model }),
        })
    }

    async fn execute(
        &self,
        wire: &WireRequest,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<WireResponse> {
        self.executes.fetch_add(1, Ordering::SeqCst);
        let model = wire.body["model"].as_str().unwrap_or("mock-model").to_string();

        let behavior = self.next_behavior();
        let body = match behavior {
            Behavior::Reply(text) => self.reply_body(&model, &text),
            Behavior::ToolCalls(calls) => json!({
                "id": "mock-tools",
                "model": model,
                "content": null,
                "finish_reason": "tool_calls",
                "tool_calls": calls.iter().map(|(id, name, args)| json!({
                    "id": id, "name": name, "arguments": args,
                })).collect::<Vec<_>>(),
            }),
            Behavior::Status(status, body) => {
                return Ok(WireResponse {
                    status,
                    body: body.into_bytes().into(),
                });
            }
            Behavior::Hang(duration, text) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(GatewayError::canceled()),
                    _ = tokio::time::sleep_until(deadline) => {
                        return Err(GatewayError::timeout("mock deadline"));
                    }
                    _ = tokio::time::sleep(duration) => {}
                }
                self.reply_body(&model, &text)
            }
            Behavior::NetworkError => {
                return Err(GatewayError::provider_unavailable("mock connect failed")
                    .with_retryable(true));
            }
        };

        Ok(WireResponse {
            status: 200,
            body: serde_json::to_vec(&body).unwrap().into(),
        })
    }

    fn parse(&self, wire: WireResponse) -> Result<ChatResponse> {
        if wire.status != 200 {
            let body = wire.body_str().to_string();
            let err = match wire.status {
                401 | 403 => GatewayError::auth("mock auth failure"),
                429 => GatewayError::rate_limited("mock rate limit"),
                400 | 404 => {
                    let e = GatewayError::invalid_request("mock rejection");
                    if body.contains("model_not_found") {
                        e.model_scoped()
                    } else {
                        e
                    }
                }
                500..=599 => GatewayError::upstream_5xx("mock server error"),
                _ => GatewayError::upstream_malformed("mock odd status"),
            };
            return Err(err.with_status(wire.status).with_body_snippet(&body));
        }

        let body: Value = serde_json::from_slice(&wire.body)?;
        let tool_calls: Vec<ToolCall> = body
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| ToolCall {
                        id: c["id"].as_str().unwrap_or_default().to_string(),
                        name: c["name"].as_str().unwrap_or_default().to_string(),
                        arguments: c["arguments"].clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let finish_reason = body
            .get("finish_reason")
            .and_then(|v| v.as_str())
            .map(FinishReason::from_wire)
            .unwrap_or(FinishReason::Stop);

        Ok(ChatResponse {
            id: body["id"].as_str().unwrap_or_default().to_string(),
            model: body["model"].as_str().unwrap_or_default().to_string(),
            choices: vec![Choice {
                index: 0,
                finish_reason,
                message: ResponseMessage {
                    role: MessageRole::Assistant,
                    content: body["content"].as_str().map(String::from),
                    tool_calls,
                },
            }],
            usage: Some(Usage {
                prompt_tokens: 3,
                completion_tokens: 2,
                total_tokens: 5,
            }),
            raw: Some(body),
            meta: Default::default(),
        })
    }
}

/// In-memory tool source answering every call with a fixed result.
pub struct StaticToolSource {
    name: String,
    tools: Vec<String>,
    result: String,
    invocations: AtomicU32,
}

impl StaticToolSource {
    pub fn new(name: &str, tools: &[&str], result: &str) -> Self {
        Self {
            name: name.to_string(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
            result: result.to_string(),
            invocations: AtomicU32::new(0),
        }
    }

    pub fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ToolSource for StaticToolSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self, _cancel: &CancelToken) -> Result<Vec<ToolDescriptor>> {
        Ok(self
            .tools
            .iter()
            .map(|t| ToolDescriptor {
                name: t.clone(),
                description: Some(format!("{} tool", t)),
                schema: Some(json!({"type": "object"})),
            })
            .collect())
    }

    async fn invoke(&self, _call: &ToolCall, _cancel: &CancelToken) -> Result<ToolOutcome> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutcome::Success(self.result.clone()))
    }
}

/// Set an env var holding a test key and return a KeyConfig for it.
pub fn env_key(var: &str) -> ai_gateway_rust::KeyConfig {
    std::env::set_var(var, format!("sk-test-{}", var.to_lowercase()));
    ai_gateway_rust::KeyConfig::new(ai_gateway_rust::SecretRef::env(var))
}

/// Opt into log output for a test run (`RUST_LOG=debug cargo test`).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
