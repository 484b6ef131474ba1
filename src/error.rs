//! 错误处理模块：网关统一错误类型与逐次尝试记录。
//!
//! # Error Handling Module
//!
//! Every failure the gateway can produce is a structured [`GatewayError`]
//! carrying a closed [`ErrorKind`], the provider/model pair that failed,
//! the attempt index within the fallback chain, and (for chain exhaustion)
//! the full list of per-attempt failures.
//!
//! ## Error Kinds
//!
//! | Kind | Description |
//! |------|-------------|
//! | `Auth` | Credential rejected by the upstream |
//! | `RateLimited` | Upstream 429 / quota pressure |
//! | `InvalidRequest` | Request cannot be expressed or was rejected as malformed |
//! | `ProviderUnavailable` | Queue full, no viable key, or connection refused |
//! | `Timeout` | Deadline exceeded at any stage |
//! | `Upstream5xx` | Upstream server error |
//! | `UpstreamMalformed` | Upstream body failed to parse into the normalized shape |
//! | `ToolExecution` | A tool source was unreachable |
//! | `PluginReject` | A plugin pre-hook rejected the request |
//! | `Canceled` | The request's cancellation token fired |
//! | `Internal` | Gateway-internal invariant violation |

use thiserror::Error;

/// Closed set of gateway error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Auth,
    RateLimited,
    InvalidRequest,
    ProviderUnavailable,
    Timeout,
    Upstream5xx,
    UpstreamMalformed,
    ToolExecution,
    PluginReject,
    Canceled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ProviderUnavailable => "provider_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Upstream5xx => "upstream_5xx",
            ErrorKind::UpstreamMalformed => "upstream_malformed",
            ErrorKind::ToolExecution => "tool_execution",
            ErrorKind::PluginReject => "plugin_reject",
            ErrorKind::Canceled => "canceled",
            ErrorKind::Internal => "internal",
        }
    }

    /// Whether a worker should retry this kind in-place (before any fallback).
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Upstream5xx | ErrorKind::Timeout
        )
    }

    /// Whether the fallback orchestrator should advance to the next chain
    /// entry after an attempt fails with this kind.
    ///
    /// Credential and upstream trouble is provider-scoped, so another
    /// provider may still succeed. Malformed requests, plugin rejections,
    /// and cancellation are request-scoped and terminal.
    pub fn advances_fallback(&self) -> bool {
        matches!(
            self,
            ErrorKind::Auth
                | ErrorKind::RateLimited
                | ErrorKind::ProviderUnavailable
                | ErrorKind::Timeout
                | ErrorKind::Upstream5xx
                | ErrorKind::UpstreamMalformed
        )
    }

    /// Severity rank used to pick the primary kind of an aggregate error.
    /// Higher is more severe.
    fn severity(&self) -> u8 {
        match self {
            ErrorKind::Auth => 10,
            ErrorKind::InvalidRequest => 9,
            ErrorKind::ProviderUnavailable => 8,
            ErrorKind::Timeout => 7,
            ErrorKind::Upstream5xx => 6,
            ErrorKind::RateLimited => 5,
            ErrorKind::UpstreamMalformed => 4,
            ErrorKind::ToolExecution => 3,
            ErrorKind::PluginReject => 2,
            ErrorKind::Canceled => 1,
            ErrorKind::Internal => 0,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt within a fallback chain, success or failure.
///
/// Successful responses carry their attempt trail in
/// [`ResponseMeta`](crate::types::response::ResponseMeta); exhausted chains
/// carry theirs in [`GatewayError::attempts`].
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub provider: String,
    pub model: String,
    pub ok: bool,
    /// Failure kind; `None` when `ok`.
    pub kind: Option<ErrorKind>,
    /// Upstream HTTP status, when one was observed.
    pub status: Option<u16>,
    pub message: Option<String>,
}

impl AttemptRecord {
    pub fn success(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ok: true,
            kind: None,
            status: None,
            message: None,
        }
    }

    pub fn failure(
        provider: impl Into<String>,
        model: impl Into<String>,
        err: &GatewayError,
    ) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            ok: false,
            kind: Some(err.kind),
            status: err.status,
            message: Some(err.message.clone()),
        }
    }
}

/// Unified gateway error.
#[derive(Debug, Error)]
#[error("{kind} error: {message}{}", format_origin(.provider, .model, .status))]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    /// Whether the failing layer considers the error transient.
    pub retryable: bool,
    /// 0-based index within the fallback chain, when attributable.
    pub attempt: Option<u32>,
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Upstream HTTP status, when one was observed.
    pub status: Option<u16>,
    /// Truncated upstream body for diagnostics.
    pub body_snippet: Option<String>,
    /// An `InvalidRequest` whose incompatibility is model-level
    /// (`model_not_supported`): the chain continues instead of aborting.
    pub model_scoped: bool,
    /// Every failure in the chain, populated on aggregate errors.
    pub attempts: Vec<AttemptRecord>,
}

fn format_origin(provider: &Option<String>, model: &Option<String>, status: &Option<u16>) -> String {
    let mut parts = Vec::new();
    if let Some(p) = provider {
        parts.push(format!("provider: {}", p));
    }
    if let Some(m) = model {
        parts.push(format!("model: {}", m));
    }
    if let Some(s) = status {
        parts.push(format!("status: {}", s));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" [{}]", parts.join(", "))
    }
}

const BODY_SNIPPET_MAX: usize = 512;

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
            attempt: None,
            provider: None,
            model: None,
            status: None,
            body_snippet: None,
            model_scoped: false,
            attempts: Vec::new(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimited, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    pub fn provider_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderUnavailable, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn upstream_5xx(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Upstream5xx, message)
    }

    pub fn upstream_malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamMalformed, message)
    }

    pub fn tool_execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ToolExecution, message)
    }

    pub fn plugin_reject(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PluginReject, message)
    }

    pub fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "request canceled")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach a truncated copy of an upstream response body.
    pub fn with_body_snippet(mut self, body: &str) -> Self {
        let snippet = if body.len() > BODY_SNIPPET_MAX {
            let mut end = BODY_SNIPPET_MAX;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            &body[..end]
        } else {
            body
        };
        self.body_snippet = Some(snippet.to_string());
        self
    }

    /// Mark an `InvalidRequest` as model-level, so the fallback chain
    /// continues rather than aborting.
    pub fn model_scoped(mut self) -> Self {
        self.model_scoped = true;
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.kind == ErrorKind::Canceled
    }

    /// Build the aggregate error for an exhausted fallback chain.
    ///
    /// The primary kind is the most severe among the recorded failures;
    /// every failure stays listed in `attempts`.
    pub fn aggregate(attempts: Vec<AttemptRecord>) -> Self {
        let primary = attempts
            .iter()
            .filter(|a| !a.ok)
            .max_by_key(|a| a.kind.map(|k| k.severity()).unwrap_or(0))
            .and_then(|a| a.kind)
            .unwrap_or(ErrorKind::Internal);

        let failed = attempts.iter().filter(|a| !a.ok).count();
        let mut err = GatewayError::new(primary, format!("all {} attempt(s) failed", failed));
        err.retryable = false;
        err.attempts = attempts;
        err
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::upstream_malformed(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering() {
        let attempts = vec![
            AttemptRecord {
                provider: "openai".into(),
                model: "gpt-4o".into(),
                ok: false,
                kind: Some(ErrorKind::RateLimited),
                status: Some(429),
                message: Some("slow down".into()),
            },
            AttemptRecord {
                provider: "anthropic".into(),
                model: "claude-3".into(),
                ok: false,
                kind: Some(ErrorKind::Auth),
                status: Some(401),
                message: Some("bad key".into()),
            },
        ];
        let agg = GatewayError::aggregate(attempts);
        assert_eq!(agg.kind, ErrorKind::Auth);
        assert_eq!(agg.attempts.len(), 2);
        assert!(!agg.retryable);
    }

    #[test]
    fn test_body_snippet_truncation() {
        let body = "x".repeat(2048);
        let err = GatewayError::upstream_5xx("boom").with_body_snippet(&body);
        assert_eq!(err.body_snippet.as_ref().map(|s| s.len()), Some(512));
    }

    #[test]
    fn test_display_carries_origin() {
        let err = GatewayError::upstream_5xx("bad gateway")
            .with_provider("openai")
            .with_model("gpt-4o")
            .with_status(502);
        let s = err.to_string();
        assert!(s.contains("upstream_5xx"));
        assert!(s.contains("provider: openai"));
        assert!(s.contains("status: 502"));
    }

    #[test]
    fn test_default_retryability() {
        assert!(GatewayError::rate_limited("x").retryable);
        assert!(GatewayError::upstream_5xx("x").retryable);
        assert!(!GatewayError::invalid_request("x").retryable);
        assert!(!GatewayError::canceled().retryable);
    }
}
