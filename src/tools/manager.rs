//! Tool discovery, filtering, injection, and bounded parallel execution.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;

use crate::cancel::CancelToken;
use crate::error::GatewayError;
use crate::types::{ChatRequest, Message, ToolCall, ToolDefinition};
use crate::Result;

use super::{ToolOutcome, ToolSource};

/// Tool rounds allowed per request unless overridden.
pub const DEFAULT_TOOL_ROUNDS: u32 = 4;
/// Concurrent tool invocations within one response.
pub const DEFAULT_TOOL_CONCURRENCY: usize = 8;

const NAMESPACE_PREFIX: &str = "mcp__";
const NAMESPACE_SEP: &str = "__";

/// Allow/deny filters carried in the request context.
///
/// Include lists take precedence; excludes are applied after includes.
/// Names refer to bare (un-namespaced) tool and source names.
#[derive(Debug, Clone, Default)]
pub struct ToolFilters {
    pub include_sources: Vec<String>,
    pub exclude_sources: Vec<String>,
    pub include_tools: Vec<String>,
    pub exclude_tools: Vec<String>,
}

impl ToolFilters {
    fn source_allowed(&self, name: &str) -> bool {
        if !self.include_sources.is_empty() && !self.include_sources.iter().any(|s| s == name) {
            return false;
        }
        !self.exclude_sources.iter().any(|s| s == name)
    }

    fn tool_allowed(&self, name: &str) -> bool {
        if !self.include_tools.is_empty() && !self.include_tools.iter().any(|t| t == name) {
            return false;
        }
        !self.exclude_tools.iter().any(|t| t == name)
    }
}

/// Coordinates tool sources for pre-call injection and post-call execution.
pub struct ToolManager {
    sources: Vec<Arc<dyn ToolSource>>,
    max_rounds: u32,
    concurrency: usize,
}

impl Default for ToolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolManager {
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            max_rounds: DEFAULT_TOOL_ROUNDS,
            concurrency: DEFAULT_TOOL_CONCURRENCY,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_max_rounds(mut self, rounds: u32) -> Self {
        self.max_rounds = rounds;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Discover tools and append the effective set to the request.
    ///
    /// Catalog order is preserved per source; sources are visited in
    /// registration order. A source that fails discovery is skipped with
    /// a warning rather than failing the request.
    pub async fn augment(
        &self,
        mut request: ChatRequest,
        filters: &ToolFilters,
        cancel: &CancelToken,
    ) -> Result<ChatRequest> {
        if self.sources.is_empty() {
            return Ok(request);
        }
        cancel.check()?;

        let mut defs: Vec<ToolDefinition> = request.params.tools.take().unwrap_or_default();
        let caller_supplied = defs.len();

        for source in &self.sources {
            if !filters.source_allowed(source.name()) {
                continue;
            }
            match source.list_tools(cancel).await {
                Ok(catalog) => {
                    for tool in catalog {
                        if !filters.tool_allowed(&tool.name) {
                            continue;
                        }
                        defs.push(ToolDefinition::function(
                            namespaced(source.name(), &tool.name),
                            tool.description,
                            tool.schema,
                        ));
                    }
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        source = source.name(),
                        error = %e,
                        "tool discovery failed; source skipped for this request"
                    );
                }
            }
        }

        tracing::debug!(
            injected = defs.len() - caller_supplied,
            caller_supplied,
            "tool augmentation complete"
        );
        if !defs.is_empty() {
            request.params.tools = Some(defs);
        }
        Ok(request)
    }

    /// Execute one round of tool calls and return the tool messages to
    /// append, in the same order as the calls.
    ///
    /// Invocations run concurrently up to the configured cap; results are
    /// re-assembled by `tool_call_id`. Execution failures become message
    /// content. Only an unreachable source fails the round.
    pub async fn execute_round(
        &self,
        calls: &[ToolCall],
        cancel: &CancelToken,
    ) -> Result<Vec<Message>> {
        cancel.check()?;

        let futs: Vec<_> = calls
            .iter()
            .map(|call| -> futures::future::BoxFuture<'_, (String, Result<ToolOutcome>)> {
                Box::pin(async move { (call.id.clone(), self.dispatch_call(call, cancel).await) })
            })
            .collect();

        let outcomes: Vec<(String, Result<ToolOutcome>)> = futures::stream::iter(futs)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut by_id: HashMap<String, Result<ToolOutcome>> = outcomes.into_iter().collect();

        let mut messages = Vec::with_capacity(calls.len());
        for call in calls {
            let outcome = by_id
                .remove(&call.id)
                .unwrap_or_else(|| Err(GatewayError::internal("tool outcome lost")));
            match outcome {
                Ok(ToolOutcome::Success(text)) => messages.push(Message::tool(&call.id, text)),
                Ok(ToolOutcome::Failure(text)) => {
                    messages.push(Message::tool(&call.id, format!("tool error: {}", text)));
                }
                Err(e) if e.is_canceled() => return Err(e),
                Err(e) => {
                    return Err(GatewayError::tool_execution(format!(
                        "tool source unreachable for call '{}': {}",
                        call.name, e
                    )));
                }
            }
        }
        Ok(messages)
    }

    /// Route a namespaced call to its owning source.
    async fn dispatch_call(&self, call: &ToolCall, cancel: &CancelToken) -> Result<ToolOutcome> {
        let Some((source, bare_name)) = self.resolve_owner(&call.name) else {
            // The model invented a name; tell it so instead of failing
            // the request.
            return Ok(ToolOutcome::Failure(format!(
                "unknown tool '{}'",
                call.name
            )));
        };
        let bare_call = ToolCall {
            id: call.id.clone(),
            name: bare_name.to_string(),
            arguments: call.arguments.clone(),
        };
        source.invoke(&bare_call, cancel).await
    }

    fn resolve_owner<'a>(&self, namespaced_name: &'a str) -> Option<(&Arc<dyn ToolSource>, &'a str)> {
        let rest = namespaced_name.strip_prefix(NAMESPACE_PREFIX)?;
        for source in &self.sources {
            if let Some(bare) = rest
                .strip_prefix(source.name())
                .and_then(|r| r.strip_prefix(NAMESPACE_SEP))
            {
                return Some((source, bare));
            }
        }
        None
    }
}

fn namespaced(source: &str, tool: &str) -> String {
    format!("{}{}{}{}", NAMESPACE_PREFIX, source, NAMESPACE_SEP, tool)
}
