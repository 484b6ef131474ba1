//! Request engine: the composition root.
//!
//! `handle` runs a fixed stage order: plugin pre hooks, tool
//! pre-augmentation, fallback dispatch with the inner tool loop, then
//! plugin post hooks in reverse. The engine owns the request-scoped
//! context (request id, deadline, cancellation, tool filters) and is the
//! only place the stages compose.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use crate::adapter::ProviderAdapter;
use crate::cancel::CancelToken;
use crate::config::ProviderConfig;
use crate::error::{AttemptRecord, GatewayError};
use crate::fallback::{DispatchBounds, FallbackOrchestrator, ProviderHandle, ProviderRegistry};
use crate::keys::KeySelector;
use crate::plugins::{Plugin, PluginContext, PluginPipeline, PreResult};
use crate::pool::{ObjectPool, ResultCell};
use crate::tools::{ToolFilters, ToolManager, ToolSource};
use crate::types::{ChatRequest, ChatResponse, Message, ModelTarget};
use crate::worker::{JobResult, RetryPolicy, WorkerPool};
use crate::Result;

/// Context-map keys accepted by [`RequestContext::from_map`].
const CTX_REQUEST_ID: &str = "request-id";
const CTX_TIMEOUT_MS: &str = "timeout-ms";
const CTX_CLIENT_SIDE_TOOLS: &str = "client-side-tools";
const CTX_INCLUDE_SOURCES: &str = "mcp-include-sources";
const CTX_EXCLUDE_SOURCES: &str = "mcp-exclude-sources";
const CTX_INCLUDE_TOOLS: &str = "mcp-include-tools";
const CTX_EXCLUDE_TOOLS: &str = "mcp-exclude-tools";

/// Request-scoped execution context.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub deadline: Option<Instant>,
    pub cancel: CancelToken,
    pub tool_filters: ToolFilters,
    /// The caller executes tool calls itself; the gateway hands them back.
    pub client_side_execution: bool,
    /// Opaque correlation fields, logged but never interpreted.
    pub correlation: HashMap<String, String>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            deadline: None,
            cancel: CancelToken::never(),
            tool_filters: ToolFilters::default(),
            client_side_execution: false,
            correlation: HashMap::new(),
        }
    }

    /// Build a context from the transport's auxiliary map.
    ///
    /// Known keys are lifted into typed fields; everything else is kept
    /// as opaque correlation data.
    pub fn from_map(map: &HashMap<String, String>) -> Self {
        let mut ctx = Self::new();
        for (key, value) in map {
            match key.as_str() {
                CTX_REQUEST_ID => ctx.request_id = value.clone(),
                CTX_TIMEOUT_MS => {
                    if let Ok(ms) = value.parse::<u64>() {
                        ctx.deadline = Some(Instant::now() + Duration::from_millis(ms));
                    }
                }
                CTX_CLIENT_SIDE_TOOLS => {
                    ctx.client_side_execution = value == "true" || value == "1";
                }
                CTX_INCLUDE_SOURCES => ctx.tool_filters.include_sources = split_list(value),
                CTX_EXCLUDE_SOURCES => ctx.tool_filters.exclude_sources = split_list(value),
                CTX_INCLUDE_TOOLS => ctx.tool_filters.include_tools = split_list(value),
                CTX_EXCLUDE_TOOLS => ctx.tool_filters.exclude_tools = split_list(value),
                _ => {
                    ctx.correlation.insert(key.clone(), value.clone());
                }
            }
        }
        ctx
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = id.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_tool_filters(mut self, filters: ToolFilters) -> Self {
        self.tool_filters = filters;
        self
    }

    pub fn with_client_side_execution(mut self, enabled: bool) -> Self {
        self.client_side_execution = enabled;
        self
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Builder for a [`GatewayEngine`].
///
/// Must be built inside a Tokio runtime: provider pools spawn their
/// workers during `build`.
#[derive(Default)]
pub struct GatewayBuilder {
    providers: Vec<(ProviderConfig, Arc<dyn ProviderAdapter>)>,
    plugins: PluginPipeline,
    tools: ToolManager,
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(
        mut self,
        config: ProviderConfig,
        adapter: Arc<dyn ProviderAdapter>,
    ) -> Self {
        self.providers.push((config, adapter));
        self
    }

    /// Register a plugin. Order is significant: pre hooks run in
    /// registration order, posts unwind in reverse.
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.plugins.register(plugin);
        self
    }

    pub fn with_tool_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.tools = self.tools.with_source(source);
        self
    }

    pub fn with_tool_rounds(mut self, rounds: u32) -> Self {
        self.tools = self.tools.with_max_rounds(rounds);
        self
    }

    pub fn with_tool_concurrency(mut self, concurrency: usize) -> Self {
        self.tools = self.tools.with_concurrency(concurrency);
        self
    }

    pub fn build(self) -> Result<GatewayEngine> {
        if self.providers.is_empty() {
            return Err(GatewayError::internal(
                "gateway needs at least one provider",
            ));
        }

        let mut registry = ProviderRegistry::new();
        for (config, adapter) in self.providers {
            let keys = config.resolve_keys()?;
            let selector = KeySelector::new(&config.name, keys);
            let pool = WorkerPool::spawn(
                &config.name,
                Arc::clone(&adapter),
                config.concurrency,
                config.queue_depth,
                RetryPolicy::new(config.max_retries),
            );
            registry.register(ProviderHandle {
                name: config.name.clone(),
                adapter,
                selector,
                pool,
                network_timeout: config.network_timeout,
            });
        }

        let registry = Arc::new(registry);
        let sinks: Arc<ObjectPool<Arc<ResultCell<JobResult>>>> =
            Arc::new(ObjectPool::new(|| Arc::new(ResultCell::new())));

        Ok(GatewayEngine {
            orchestrator: FallbackOrchestrator::new(Arc::clone(&registry), Arc::clone(&sinks)),
            registry,
            plugins: self.plugins,
            tools: self.tools,
            sinks,
            buffers: Arc::new(ObjectPool::new(Vec::new)),
            scratch: Arc::new(ObjectPool::new(Vec::new)),
        })
    }
}

/// Pool counters for integrity checks and introspection.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub sinks_acquired: u64,
    pub sinks_released: u64,
    pub buffers_acquired: u64,
    pub buffers_released: u64,
    pub scratch_acquired: u64,
    pub scratch_released: u64,
}

/// The request-processing engine.
pub struct GatewayEngine {
    registry: Arc<ProviderRegistry>,
    orchestrator: FallbackOrchestrator,
    plugins: PluginPipeline,
    tools: ToolManager,
    sinks: Arc<ObjectPool<Arc<ResultCell<JobResult>>>>,
    buffers: Arc<ObjectPool<Vec<u8>>>,
    scratch: Arc<ObjectPool<Vec<Message>>>,
}

impl GatewayEngine {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            sinks_acquired: self.sinks.acquired(),
            sinks_released: self.sinks.released(),
            buffers_acquired: self.buffers.acquired(),
            buffers_released: self.buffers.released(),
            scratch_acquired: self.scratch.acquired(),
            scratch_released: self.scratch.released(),
        }
    }

    /// Process one request with a fresh context.
    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse> {
        self.handle_with_context(request, RequestContext::new())
            .await
    }

    /// Process one request.
    ///
    /// Exactly one of response or error comes back; when a response does,
    /// every post hook entitled to run has run.
    pub async fn handle_with_context(
        &self,
        request: ChatRequest,
        ctx: RequestContext,
    ) -> Result<ChatResponse> {
        let started = Instant::now();
        let mut plugin_ctx = PluginContext::new(&ctx.request_id, &request.model);

        {
            // Serialize once into a pooled buffer for the ingress log line.
            let mut buf = self.buffers.acquire();
            if serde_json::to_writer(&mut *buf, &request).is_ok() {
                tracing::debug!(
                    request_id = ctx.request_id.as_str(),
                    model = request.model.as_str(),
                    payload_bytes = buf.len(),
                    fallbacks = request.fallback_chain.len(),
                    "request accepted"
                );
            }
        }

        match self.plugins.run_pre(&mut plugin_ctx, request).await {
            PreResult::Failed {
                request,
                error,
                entered,
            } => {
                self.plugins
                    .unwind_error(&mut plugin_ctx, &entered, &request, &error)
                    .await;
                tracing::info!(
                    request_id = ctx.request_id.as_str(),
                    kind = error.kind.as_str(),
                    "request rejected in plugin pre phase"
                );
                Err(error)
            }
            PreResult::ShortCircuit {
                request,
                mut response,
                entered,
            } => {
                response.meta.request_id = ctx.request_id.clone();
                response.meta.latency_ms = started.elapsed().as_millis() as u64;
                Ok(self
                    .plugins
                    .unwind_post(&mut plugin_ctx, &entered, &request, response)
                    .await)
            }
            PreResult::Proceed { request, entered } => {
                let outcome = self.dispatch_stage(request.clone(), &ctx).await;
                match outcome {
                    Ok((mut response, attempts, served_by, tool_rounds)) => {
                        plugin_ctx.provider = Some(served_by.provider.clone());
                        response.meta.request_id = ctx.request_id.clone();
                        response.meta.latency_ms = started.elapsed().as_millis() as u64;
                        response.meta.attempts = attempts;
                        response.meta.tool_rounds = tool_rounds;
                        tracing::info!(
                            request_id = ctx.request_id.as_str(),
                            provider = served_by.provider.as_str(),
                            model = served_by.model.as_str(),
                            attempts = response.meta.attempts.len(),
                            tool_rounds,
                            duration_ms = response.meta.latency_ms,
                            "request served"
                        );
                        Ok(self
                            .plugins
                            .unwind_post(&mut plugin_ctx, &entered, &request, response)
                            .await)
                    }
                    Err(error) => {
                        self.plugins
                            .unwind_error(&mut plugin_ctx, &entered, &request, &error)
                            .await;
                        tracing::info!(
                            request_id = ctx.request_id.as_str(),
                            kind = error.kind.as_str(),
                            attempts = error.attempts.len(),
                            duration_ms = started.elapsed().as_millis() as u64,
                            "request failed"
                        );
                        Err(error)
                    }
                }
            }
        }
    }

    /// Tool augmentation, fallback dispatch, and the inner tool loop.
    async fn dispatch_stage(
        &self,
        request: ChatRequest,
        ctx: &RequestContext,
    ) -> Result<(ChatResponse, Vec<AttemptRecord>, ModelTarget, u32)> {
        let request = self
            .tools
            .augment(request, &ctx.tool_filters, &ctx.cancel)
            .await?;

        let bounds = DispatchBounds {
            cancel: ctx.cancel.clone(),
            deadline: ctx.deadline,
        };

        let (response, attempts, served_by) = self.orchestrator.execute(&request, &bounds).await?;

        let last_attempt = attempts.len().saturating_sub(1) as u32;
        let (response, tool_rounds) = self
            .tool_loop(response, &request, &served_by, &bounds, last_attempt, ctx)
            .await?;

        Ok((response, attempts, served_by, tool_rounds))
    }

    /// Bounded re-entrant tool loop against the provider that served the
    /// response. Never re-enters the fallback chain or the plugin
    /// pipeline.
    async fn tool_loop(
        &self,
        mut response: ChatResponse,
        request: &ChatRequest,
        served_by: &ModelTarget,
        bounds: &DispatchBounds,
        attempt: u32,
        ctx: &RequestContext,
    ) -> Result<(ChatResponse, u32)> {
        if ctx.client_side_execution || self.tools.is_empty() {
            return Ok((response, 0));
        }

        let mut convo = self.scratch.acquire();
        convo.extend(request.messages());

        let mut rounds: u32 = 0;
        while response.has_tool_calls() && rounds < self.tools.max_rounds() {
            bounds.cancel.check()?;

            let calls = response.tool_calls().to_vec();
            tracing::debug!(
                request_id = ctx.request_id.as_str(),
                round = rounds + 1,
                calls = calls.len(),
                "executing tool round"
            );
            let tool_messages = self.tools.execute_round(&calls, &bounds.cancel).await?;

            convo.push(Message::assistant_tool_calls(
                response.first_content().map(String::from),
                calls,
            ));
            convo.extend(tool_messages);

            let next = request.clone().with_messages(convo.to_vec());
            response = self
                .orchestrator
                .dispatch_to(served_by, &next, bounds, attempt)
                .await?;
            rounds += 1;
        }

        // Budget exhaustion leaves the final tool_calls finish reason
        // intact for the caller to act on.
        Ok((response, rounds))
    }
}
