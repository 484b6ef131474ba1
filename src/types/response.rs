//! Normalized response shape constructed by adapters and decorated by the
//! tool manager and plugin post-hooks.

use serde_json::Value;

use crate::error::AttemptRecord;

use super::message::MessageRole;
use super::tool::ToolCall;

/// Closed set of normalized finish reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Error,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Error => "error",
        }
    }

    /// Normalize a provider finish/stop reason into the closed set.
    /// Unknown reasons map to `Stop` rather than `Error`; the upstream
    /// completed, it just used vocabulary we do not track.
    pub fn from_wire(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" => FinishReason::Stop,
            "length" | "max_tokens" => FinishReason::Length,
            "tool_calls" | "tool_use" | "function_call" => FinishReason::ToolCalls,
            "content_filter" | "safety" => FinishReason::ContentFilter,
            "error" => FinishReason::Error,
            _ => FinishReason::Stop,
        }
    }
}

/// The message inside one choice.
#[derive(Debug, Clone)]
pub struct ResponseMessage {
    pub role: MessageRole,
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ResponseMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Choice {
    pub index: u32,
    pub finish_reason: FinishReason,
    pub message: ResponseMessage,
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Request-scoped execution metadata accreted by the engine.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub request_id: String,
    pub latency_ms: u64,
    /// Full attempt trail, including the successful attempt.
    pub attempts: Vec<AttemptRecord>,
    /// Tool rounds spent on this response.
    pub tool_rounds: u32,
}

/// Normalized response envelope.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Opaque upstream id, or a gateway-assigned one for synthetic responses.
    pub id: String,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Option<Usage>,
    /// Raw provider echo, untouched.
    pub raw: Option<Value>,
    pub meta: ResponseMeta,
}

impl Default for Choice {
    fn default() -> Self {
        Self {
            index: 0,
            finish_reason: FinishReason::Stop,
            message: ResponseMessage {
                role: MessageRole::Assistant,
                content: None,
                tool_calls: Vec::new(),
            },
        }
    }
}

impl ChatResponse {
    /// Build a minimal synthetic response, used by plugin short-circuits.
    pub fn synthetic(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: format!("gw-{}", uuid::Uuid::new_v4()),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                finish_reason: FinishReason::Stop,
                message: ResponseMessage::assistant(content),
            }],
            usage: None,
            raw: None,
            meta: ResponseMeta::default(),
        }
    }

    /// Text content of the first choice, if any.
    pub fn first_content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.message.content.as_deref())
    }

    /// Tool calls carried by the first choice.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.choices
            .first()
            .map(|c| c.message.tool_calls.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_normalization() {
        assert_eq!(FinishReason::from_wire("end_turn"), FinishReason::Stop);
        assert_eq!(FinishReason::from_wire("max_tokens"), FinishReason::Length);
        assert_eq!(FinishReason::from_wire("tool_use"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::from_wire("weird_reason"), FinishReason::Stop);
    }

    #[test]
    fn test_synthetic_response() {
        let resp = ChatResponse::synthetic("gpt-4o", "cached answer");
        assert_eq!(resp.first_content(), Some("cached answer"));
        assert!(!resp.has_tool_calls());
        assert!(resp.id.starts_with("gw-"));
    }
}
