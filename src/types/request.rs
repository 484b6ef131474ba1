//! Normalized request envelope accepted by the engine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::Message;
use super::tool::ToolDefinition;

/// One `(provider, model)` pair in a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelTarget {
    pub provider: String,
    pub model: String,
}

impl ModelTarget {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }
}

/// Request input: a role-tagged conversation or a bare completion prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestInput {
    Messages(Vec<Message>),
    Prompt(String),
}

impl RequestInput {
    /// View the input as messages, wrapping a bare prompt in a user turn.
    pub fn as_messages(&self) -> Vec<Message> {
        match self {
            RequestInput::Messages(msgs) => msgs.clone(),
            RequestInput::Prompt(p) => vec![Message::user(p.clone())],
        }
    }
}

/// Bounded option bag for generation parameters.
///
/// `extras` is keyed by provider name; each adapter reads only its own
/// sub-object and the engine never inspects it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    /// Tool-choice policy in the provider-agnostic OpenAI shape.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    /// Provider-specific extras, keyed by provider name.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extras: serde_json::Map<String, Value>,
}

impl GenerationParams {
    /// Extras object for one provider, if any.
    pub fn extras_for(&self, provider: &str) -> Option<&Value> {
        self.extras.get(provider)
    }
}

/// Normalized request envelope.
///
/// Immutable once the engine starts executing it; plugin pre-hooks replace
/// the whole envelope rather than mutating in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Preferred provider. Defaults to the first provider that serves the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub model: String,
    pub input: RequestInput,
    #[serde(default)]
    pub params: GenerationParams,
    /// Ordered alternates tried after the primary, excluding the primary itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_chain: Vec<ModelTarget>,
}

impl ChatRequest {
    pub fn chat(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            provider: None,
            model: model.into(),
            input: RequestInput::Messages(messages),
            params: GenerationParams::default(),
            fallback_chain: Vec::new(),
        }
    }

    pub fn completion(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            provider: None,
            model: model.into(),
            input: RequestInput::Prompt(prompt.into()),
            params: GenerationParams::default(),
            fallback_chain: Vec::new(),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_fallback(mut self, target: ModelTarget) -> Self {
        self.fallback_chain.push(target);
        self
    }

    pub fn with_fallback_chain(mut self, chain: Vec<ModelTarget>) -> Self {
        self.fallback_chain = chain;
        self
    }

    /// Replace the conversation, keeping everything else. Used by the tool
    /// loop to append tool results before re-prompting.
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.input = RequestInput::Messages(messages);
        self
    }

    pub fn messages(&self) -> Vec<Message> {
        self.input.as_messages()
    }
}
