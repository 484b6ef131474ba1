//! Base plugin types.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::types::{ChatRequest, ChatResponse};
use crate::Result;

/// Request-scoped state shared across a plugin's pre and post hooks.
///
/// `metadata` is the plugins' scratch space; a pre hook can stash a value
/// and read it back in post during the unwind.
#[derive(Debug, Clone, Default)]
pub struct PluginContext {
    pub request_id: String,
    pub model: String,
    /// Provider that served the request, once known.
    pub provider: Option<String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PluginContext {
    pub fn new(request_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            model: model.into(),
            provider: None,
            metadata: HashMap::new(),
        }
    }
}

/// What a pre hook decided.
pub enum PreOutcome {
    /// Keep going with this (possibly replaced) request.
    Continue(ChatRequest),
    /// Skip remaining pre hooks, dispatch, and tool augmentation; answer
    /// with this synthetic response. Posts still unwind for earlier plugins.
    ShortCircuit(ChatResponse),
}

/// An ingress/egress interceptor.
///
/// The name is stable; it drives logging and post-order unwinding.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Ingress hook, run in registration order.
    async fn pre(&self, _ctx: &mut PluginContext, request: ChatRequest) -> Result<PreOutcome> {
        Ok(PreOutcome::Continue(request))
    }

    /// Egress hook, run in reverse registration order for every plugin
    /// whose `pre` returned `Continue`.
    async fn post(
        &self,
        _ctx: &mut PluginContext,
        _request: &ChatRequest,
        response: ChatResponse,
    ) -> Result<ChatResponse> {
        Ok(response)
    }

    /// Error-path unwind hook, run in reverse order when the request
    /// terminates with an error after this plugin's `pre` succeeded.
    async fn on_error(
        &self,
        _ctx: &mut PluginContext,
        _request: &ChatRequest,
        _error: &GatewayError,
    ) {
    }
}
