//! Sequential fallback orchestration across an attempt chain.
//!
//! The chain is a finite, acyclic walk over `(provider, model)` entries:
//! primary first, then each configured alternate. Per entry the
//! orchestrator selects a key, synthesizes a per-attempt deadline,
//! submits a job to the provider's pool, and awaits the result sink.
//! Attempt records are immutable once taken and accrete into either the
//! successful response's metadata or the final aggregate error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::adapter::{Capability, ProviderAdapter};
use crate::cancel::CancelToken;
use crate::error::{AttemptRecord, ErrorKind, GatewayError};
use crate::keys::KeySelector;
use crate::pool::{ObjectPool, ResultCell};
use crate::types::{ChatRequest, ChatResponse, ModelTarget};
use crate::worker::{Job, JobResult, WorkerPool};
use crate::Result;

/// Everything the orchestrator needs to dispatch to one provider.
pub struct ProviderHandle {
    pub name: String,
    pub adapter: Arc<dyn ProviderAdapter>,
    pub selector: KeySelector,
    pub pool: WorkerPool,
    pub network_timeout: Duration,
}

/// Registered providers, keyed by name, registration order retained.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderHandle>>,
    order: Vec<String>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: ProviderHandle) {
        let name = handle.name.clone();
        if self.providers.insert(name.clone(), Arc::new(handle)).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<ProviderHandle>> {
        self.providers.get(name)
    }

    /// First registered provider, the default when a request has no hint.
    pub fn default_provider(&self) -> Option<&str> {
        self.order.first().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Drives one request through its attempt chain.
pub struct FallbackOrchestrator {
    registry: Arc<ProviderRegistry>,
    sinks: Arc<ObjectPool<Arc<ResultCell<JobResult>>>>,
}

/// Deadline/cancellation inputs for one dispatch.
#[derive(Clone)]
pub struct DispatchBounds {
    pub cancel: CancelToken,
    /// Overall request deadline, if the caller set one.
    pub deadline: Option<Instant>,
}

impl DispatchBounds {
    fn attempt_deadline(&self, network_timeout: Duration) -> Instant {
        let candidate = Instant::now() + network_timeout;
        match self.deadline {
            Some(overall) => candidate.min(overall),
            None => candidate,
        }
    }
}

impl FallbackOrchestrator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        sinks: Arc<ObjectPool<Arc<ResultCell<JobResult>>>>,
    ) -> Self {
        Self { registry, sinks }
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Walk the chain until an attempt succeeds or the chain is exhausted.
    ///
    /// Returns the response, the full attempt trail, and the entry that
    /// served it (the tool loop re-enters that same entry).
    pub async fn execute(
        &self,
        request: &ChatRequest,
        bounds: &DispatchBounds,
    ) -> std::result::Result<(ChatResponse, Vec<AttemptRecord>, ModelTarget), GatewayError> {
        let primary_provider = match &request.provider {
            Some(p) => p.clone(),
            None => self
                .registry
                .default_provider()
                .ok_or_else(|| GatewayError::internal("no providers registered"))?
                .to_string(),
        };

        // The chain is fixed before the first attempt; nothing mutates it.
        let mut chain = Vec::with_capacity(1 + request.fallback_chain.len());
        chain.push(ModelTarget::new(primary_provider, request.model.clone()));
        chain.extend(request.fallback_chain.iter().cloned());

        let mut attempts: Vec<AttemptRecord> = Vec::new();

        for (i, target) in chain.iter().enumerate() {
            if bounds.cancel.is_canceled() {
                let mut err = GatewayError::canceled();
                err.attempts = attempts;
                return Err(err);
            }

            match self.dispatch_to(target, request, bounds, i as u32).await {
                Ok(response) => {
                    attempts.push(AttemptRecord::success(&target.provider, &target.model));
                    return Ok((response, attempts, target.clone()));
                }
                Err(err) => {
                    tracing::info!(
                        provider = target.provider.as_str(),
                        model = target.model.as_str(),
                        attempt = i,
                        kind = err.kind.as_str(),
                        status = err.status,
                        "attempt failed"
                    );
                    attempts.push(AttemptRecord::failure(&target.provider, &target.model, &err));

                    let advances = err.kind.advances_fallback()
                        || (err.kind == ErrorKind::InvalidRequest && err.model_scoped);
                    if !advances {
                        // Request-scoped failure: trying other providers
                        // would waste attempts on the same rejection.
                        let mut terminal = err;
                        terminal.attempts = attempts;
                        return Err(terminal);
                    }
                }
            }
        }

        Err(GatewayError::aggregate(attempts))
    }

    /// One attempt against one `(provider, model)` entry.
    ///
    /// Also the tool loop's re-entry point: re-prompting after tool
    /// execution goes straight here, never back through the chain.
    pub async fn dispatch_to(
        &self,
        target: &ModelTarget,
        request: &ChatRequest,
        bounds: &DispatchBounds,
        attempt: u32,
    ) -> Result<ChatResponse> {
        let handle = self.registry.get(&target.provider).ok_or_else(|| {
            GatewayError::provider_unavailable(format!(
                "provider '{}' is not registered",
                target.provider
            ))
            .with_provider(target.provider.clone())
            .with_attempt(attempt)
        })?;

        preflight_capabilities(handle.adapter.as_ref(), request, target, attempt)?;

        let key = handle
            .selector
            .select(&target.model)
            .map_err(|e| e.with_attempt(attempt))?;

        let deadline = bounds.attempt_deadline(handle.network_timeout);
        let sink = self.sinks.acquire();

        let job = Job {
            request: request.clone(),
            model: target.model.clone(),
            key: key.clone(),
            attempt,
            deadline,
            cancel: bounds.cancel.clone(),
            sink: Arc::clone(&*sink),
        };

        handle
            .pool
            .submit(job, deadline)
            .await
            .map_err(|e| e.with_attempt(attempt))?;

        let outcome = tokio::select! {
            _ = bounds.cancel.cancelled() => {
                Err(GatewayError::canceled()
                    .with_provider(target.provider.clone())
                    .with_attempt(attempt))
            }
            _ = tokio::time::sleep_until(deadline) => {
                Err(GatewayError::timeout("attempt deadline elapsed")
                    .with_provider(target.provider.clone())
                    .with_model(target.model.clone())
                    .with_attempt(attempt))
            }
            result = sink.recv() => result,
        };

        // The selector is the sole writer of key health.
        match &outcome {
            Ok(_) => handle.selector.report_success(&key),
            Err(e) if e.retryable => handle.selector.report_failure(&key),
            Err(_) => {}
        }

        outcome
    }
}

/// Fail before dispatch when the adapter cannot express the request.
///
/// A tools-bearing request against a provider without tool support would
/// only come back as an upstream rejection after a wasted network call.
fn preflight_capabilities(
    adapter: &dyn ProviderAdapter,
    request: &ChatRequest,
    target: &ModelTarget,
    attempt: u32,
) -> Result<()> {
    let wants_tools = request
        .params
        .tools
        .as_ref()
        .map(|t| !t.is_empty())
        .unwrap_or(false);
    if wants_tools && !adapter.supports(Capability::Tools) {
        return Err(GatewayError::invalid_request(format!(
            "provider '{}' cannot express tool calls",
            target.provider
        ))
        .with_provider(target.provider.clone())
        .with_model(target.model.clone())
        .with_attempt(attempt)
        .model_scoped());
    }
    Ok(())
}
