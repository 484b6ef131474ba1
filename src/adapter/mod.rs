//! Provider 适配层 — 统一请求与各厂商 API 之间的翻译与执行契约
//!
//! Provider adapter layer. One implementation per upstream API shape,
//! behind an object-safe trait for runtime polymorphism. Adapters are
//! stateless after construction: they hold only the shared HTTP client
//! and the provider base URL, and they are only ever invoked from inside
//! a worker.
//!
//! The contract has three steps:
//! 1. `prepare` — translate the normalized request plus a selected key
//!    into a provider-native wire request. Fails with `invalid_request`
//!    when the request uses a feature the provider cannot express.
//! 2. `execute` — perform one HTTP call under the job's deadline and
//!    cancellation token.
//! 3. `parse` — map the wire response back into the normalized shape,
//!    classifying upstream failures into the gateway error taxonomy.

pub mod anthropic;
pub mod openai;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::time::Instant;

use crate::cancel::CancelToken;
use crate::error::GatewayError;
use crate::keys::Secret;
use crate::types::ChatRequest;
use crate::types::ChatResponse;
use crate::Result;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAiAdapter;

/// Request features a provider can express.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Tools,
    SystemMessages,
    Streaming,
    Images,
}

/// Provider-native HTTP request produced by `prepare`.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
}

/// Raw HTTP response handed to `parse`.
#[derive(Debug, Clone)]
pub struct WireResponse {
    pub status: u16,
    pub body: Bytes,
}

impl WireResponse {
    pub fn body_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Provider-specific translation and execution contract.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider name (matches configuration and fallback chains).
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    /// Produce the provider-native payload and headers for one attempt.
    fn prepare(&self, request: &ChatRequest, model: &str, key: &Secret) -> Result<WireRequest>;

    /// Perform the network call under a deadline and cancellation token.
    async fn execute(
        &self,
        wire: &WireRequest,
        deadline: Instant,
        cancel: &CancelToken,
    ) -> Result<WireResponse>;

    /// Map the wire response into the normalized shape, classifying
    /// upstream errors.
    fn parse(&self, wire: WireResponse) -> Result<ChatResponse>;

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

/// Shared `execute` body used by the bundled adapters.
///
/// Honors cancellation and the attempt deadline at the suspension point,
/// and classifies transport-level failures (upstream status classification
/// stays in `parse`).
pub(crate) async fn send_wire(
    client: &reqwest::Client,
    provider: &str,
    wire: &WireRequest,
    deadline: Instant,
    cancel: &CancelToken,
) -> Result<WireResponse> {
    cancel.check()?;

    let mut req = match wire.method.as_str() {
        "GET" => client.get(&wire.url),
        _ => client.post(&wire.url).json(&wire.body),
    };
    for (name, value) in &wire.headers {
        req = req.header(name, value);
    }

    let send = async {
        let resp = req
            .send()
            .await
            .map_err(|e| classify_transport_error(provider, e))?;
        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(|e| {
            GatewayError::provider_unavailable(format!("body read failed: {}", e))
                .with_provider(provider)
                .with_retryable(true)
        })?;
        Ok(WireResponse { status, body })
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(GatewayError::canceled().with_provider(provider)),
        _ = tokio::time::sleep_until(deadline) => Err(GatewayError::timeout("network deadline exceeded")
            .with_provider(provider)),
        out = send => out,
    }
}

fn classify_transport_error(provider: &str, e: reqwest::Error) -> GatewayError {
    if e.is_timeout() {
        GatewayError::timeout(format!("HTTP timeout: {}", e)).with_provider(provider)
    } else if e.is_connect() {
        GatewayError::provider_unavailable(format!("connect failed: {}", e))
            .with_provider(provider)
            .with_retryable(true)
    } else {
        GatewayError::provider_unavailable(format!("transport error: {}", e))
            .with_provider(provider)
            .with_retryable(true)
    }
}

/// Classify a non-2xx upstream status into the error taxonomy.
///
/// Model-level 400/404 rejections are marked model-scoped so the fallback
/// chain keeps going; other invalid requests abort it.
pub(crate) fn classify_status(provider: &str, status: u16, body: &str) -> GatewayError {
    let err = match status {
        401 | 403 => GatewayError::auth(format!("upstream rejected credentials ({})", status)),
        429 => GatewayError::rate_limited("upstream rate limit"),
        400 | 404 => {
            let e = GatewayError::invalid_request(format!("upstream rejected request ({})", status));
            if is_model_scoped_rejection(body) {
                e.model_scoped()
            } else {
                e
            }
        }
        408 => GatewayError::timeout("upstream request timeout"),
        500..=599 => GatewayError::upstream_5xx(format!("upstream server error ({})", status)),
        _ => GatewayError::upstream_malformed(format!("unexpected upstream status {}", status)),
    };
    err.with_provider(provider)
        .with_status(status)
        .with_body_snippet(body)
}

/// Conservative detection of "this model, not this request" rejections.
fn is_model_scoped_rejection(body: &str) -> bool {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let code = json
            .pointer("/error/code")
            .or_else(|| json.pointer("/error/type"))
            .and_then(|v| v.as_str());
        if let Some(code) = code {
            return matches!(
                code,
                "model_not_found" | "model_not_supported" | "model_decommissioned" | "invalid_model"
            );
        }
    }
    let lower = body.to_lowercase();
    lower.contains("model")
        && (lower.contains("not found")
            || lower.contains("not supported")
            || lower.contains("decommission"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            classify_status("openai", 401, "").kind,
            crate::error::ErrorKind::Auth
        );
        assert_eq!(
            classify_status("openai", 429, "").kind,
            crate::error::ErrorKind::RateLimited
        );
        assert_eq!(
            classify_status("openai", 503, "").kind,
            crate::error::ErrorKind::Upstream5xx
        );
        assert_eq!(
            classify_status("openai", 400, "{}").kind,
            crate::error::ErrorKind::InvalidRequest
        );
    }

    #[test]
    fn test_model_scoped_rejection_by_code() {
        let body = r#"{"error": {"code": "model_not_found", "message": "nope"}}"#;
        let err = classify_status("openai", 404, body);
        assert!(err.model_scoped);

        let plain = r#"{"error": {"code": "invalid_prompt", "message": "nope"}}"#;
        assert!(!classify_status("openai", 400, plain).model_scoped);
    }

    #[test]
    fn test_model_scoped_rejection_heuristic() {
        let err = classify_status("x", 404, "The model `gpt-9` was not found");
        assert!(err.model_scoped);
    }

    #[test]
    fn test_5xx_and_429_are_retryable() {
        assert!(classify_status("p", 500, "").retryable);
        assert!(classify_status("p", 429, "").retryable);
        assert!(!classify_status("p", 401, "").retryable);
    }
}
