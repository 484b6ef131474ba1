//! Ordered plugin execution with an explicit entered-plugin stack.
//!
//! The pipeline is a mini-stack: pre hooks push entered plugins, exit
//! paths pop them in reverse. The stack is explicit rather than relying
//! on unwinding, so short-circuits and terminal errors unwind exactly
//! the plugins that entered.

use std::sync::Arc;

use crate::error::GatewayError;
use crate::types::{ChatRequest, ChatResponse};

use super::base::{Plugin, PluginContext, PreOutcome};

/// Result of running the pre phase.
pub enum PreResult {
    /// All pre hooks returned `Continue`.
    Proceed {
        request: ChatRequest,
        entered: Vec<usize>,
    },
    /// A plugin answered synthetically; dispatch and tool augmentation
    /// are skipped. `entered` excludes the short-circuiting plugin.
    ShortCircuit {
        request: ChatRequest,
        response: ChatResponse,
        entered: Vec<usize>,
    },
    /// A pre hook failed; the error is terminal. `entered` excludes the
    /// failing plugin.
    Failed {
        request: ChatRequest,
        error: GatewayError,
        entered: Vec<usize>,
    },
}

/// Ordered list of plugins, registration order significant.
#[derive(Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Run pre hooks in registration order, tracking the entered stack.
    pub async fn run_pre(&self, ctx: &mut PluginContext, mut request: ChatRequest) -> PreResult {
        let mut entered = Vec::with_capacity(self.plugins.len());

        for (i, plugin) in self.plugins.iter().enumerate() {
            // Snapshot so the unwind path still has the request this
            // plugin saw, even though the hook consumes the envelope.
            let snapshot = request.clone();
            match plugin.pre(ctx, request).await {
                Ok(PreOutcome::Continue(replaced)) => {
                    entered.push(i);
                    request = replaced;
                }
                Ok(PreOutcome::ShortCircuit(response)) => {
                    tracing::debug!(
                        plugin = plugin.name(),
                        request_id = ctx.request_id.as_str(),
                        "plugin short-circuited the request"
                    );
                    // The short-circuiting plugin did not "enter": its own
                    // post does not run, only those before it unwind.
                    return PreResult::ShortCircuit {
                        request: snapshot,
                        response,
                        entered,
                    };
                }
                Err(error) => {
                    tracing::debug!(
                        plugin = plugin.name(),
                        request_id = ctx.request_id.as_str(),
                        kind = error.kind.as_str(),
                        "plugin pre hook failed"
                    );
                    return PreResult::Failed {
                        request: snapshot,
                        error,
                        entered,
                    };
                }
            }
        }

        PreResult::Proceed { request, entered }
    }

    /// Unwind post hooks in reverse entered order.
    ///
    /// A failing post is logged and skipped; the response flows to the
    /// next hook unchanged.
    pub async fn unwind_post(
        &self,
        ctx: &mut PluginContext,
        entered: &[usize],
        request: &ChatRequest,
        mut response: ChatResponse,
    ) -> ChatResponse {
        for &i in entered.iter().rev() {
            let plugin = &self.plugins[i];
            let snapshot = response.clone();
            match plugin.post(ctx, request, response).await {
                Ok(next) => response = next,
                Err(e) => {
                    tracing::warn!(
                        plugin = plugin.name(),
                        request_id = ctx.request_id.as_str(),
                        error = %e,
                        "plugin post hook failed; response passed through unchanged"
                    );
                    response = snapshot;
                }
            }
        }
        response
    }

    /// Unwind error hooks in reverse entered order for a terminal error.
    pub async fn unwind_error(
        &self,
        ctx: &mut PluginContext,
        entered: &[usize],
        request: &ChatRequest,
        error: &GatewayError,
    ) {
        for &i in entered.iter().rev() {
            self.plugins[i].on_error(ctx, request, error).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct RecordingPlugin {
        name: String,
        log: Arc<Mutex<Vec<String>>>,
        mode: Mode,
    }

    enum Mode {
        Pass,
        ShortCircuit,
        Reject,
        FailPost,
    }

    impl RecordingPlugin {
        fn new(name: &str, log: Arc<Mutex<Vec<String>>>, mode: Mode) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                log,
                mode,
            })
        }
    }

    #[async_trait]
    impl Plugin for RecordingPlugin {
        fn name(&self) -> &str {
            &self.name
        }

        async fn pre(&self, _ctx: &mut PluginContext, req: ChatRequest) -> Result<PreOutcome> {
            self.log.lock().unwrap().push(format!("pre:{}", self.name));
            match self.mode {
                Mode::ShortCircuit => Ok(PreOutcome::ShortCircuit(ChatResponse::synthetic(
                    "m", "cached",
                ))),
                Mode::Reject => Err(GatewayError::plugin_reject(format!(
                    "{} rejected the request",
                    self.name
                ))),
                _ => Ok(PreOutcome::Continue(req)),
            }
        }

        async fn post(
            &self,
            _ctx: &mut PluginContext,
            _req: &ChatRequest,
            resp: ChatResponse,
        ) -> Result<ChatResponse> {
            self.log.lock().unwrap().push(format!("post:{}", self.name));
            match self.mode {
                Mode::FailPost => Err(GatewayError::internal("post blew up")),
                _ => Ok(resp),
            }
        }
    }

    fn request() -> ChatRequest {
        ChatRequest::chat("m", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn test_post_order_is_reverse_of_pre() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new()
            .with_plugin(RecordingPlugin::new("p1", log.clone(), Mode::Pass))
            .with_plugin(RecordingPlugin::new("p2", log.clone(), Mode::Pass))
            .with_plugin(RecordingPlugin::new("p3", log.clone(), Mode::Pass));

        let mut ctx = PluginContext::new("req-1", "m");
        let pre = pipeline.run_pre(&mut ctx, request()).await;
        let PreResult::Proceed { request, entered } = pre else {
            panic!("expected proceed");
        };
        pipeline
            .unwind_post(&mut ctx, &entered, &request, ChatResponse::synthetic("m", "ok"))
            .await;

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["pre:p1", "pre:p2", "pre:p3", "post:p3", "post:p2", "post:p1"]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_unwinds_only_prior_plugins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new()
            .with_plugin(RecordingPlugin::new("p1", log.clone(), Mode::Pass))
            .with_plugin(RecordingPlugin::new("p2", log.clone(), Mode::ShortCircuit))
            .with_plugin(RecordingPlugin::new("p3", log.clone(), Mode::Pass));

        let mut ctx = PluginContext::new("req-2", "m");
        let pre = pipeline.run_pre(&mut ctx, request()).await;
        let PreResult::ShortCircuit {
            request,
            response,
            entered,
        } = pre
        else {
            panic!("expected short circuit");
        };
        assert_eq!(entered, vec![0]);
        pipeline.unwind_post(&mut ctx, &entered, &request, response).await;

        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["pre:p1", "pre:p2", "post:p1"]
        );
    }

    #[tokio::test]
    async fn test_reject_is_terminal_and_skips_own_post() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new()
            .with_plugin(RecordingPlugin::new("auth", log.clone(), Mode::Reject))
            .with_plugin(RecordingPlugin::new("p2", log.clone(), Mode::Pass));

        let mut ctx = PluginContext::new("req-3", "m");
        let pre = pipeline.run_pre(&mut ctx, request()).await;
        let PreResult::Failed { error, entered, .. } = pre else {
            panic!("expected failure");
        };
        assert_eq!(error.kind, crate::error::ErrorKind::PluginReject);
        assert!(entered.is_empty());
        assert_eq!(log.lock().unwrap().as_slice(), &["pre:auth"]);
    }

    #[tokio::test]
    async fn test_post_failure_passes_response_through() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PluginPipeline::new()
            .with_plugin(RecordingPlugin::new("p1", log.clone(), Mode::Pass))
            .with_plugin(RecordingPlugin::new("p2", log.clone(), Mode::FailPost));

        let mut ctx = PluginContext::new("req-4", "m");
        let pre = pipeline.run_pre(&mut ctx, request()).await;
        let PreResult::Proceed { request, entered } = pre else {
            panic!("expected proceed");
        };
        let resp = pipeline
            .unwind_post(
                &mut ctx,
                &entered,
                &request,
                ChatResponse::synthetic("m", "payload"),
            )
            .await;

        // p2's post failed but the payload survived to p1 and out.
        assert_eq!(resp.first_content(), Some("payload"));
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &["pre:p1", "pre:p2", "post:p2", "post:p1"]
        );
    }
}
