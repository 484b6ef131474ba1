//! # ai-gateway-rust
//!
//! Request-processing engine for a multi-provider AI model gateway.
//!
//! Callers hand the engine one normalized request naming a model; the
//! engine runs plugin pre hooks, injects externally discovered tools,
//! selects a credential and dispatches the call through the target
//! provider's isolated worker pool, falls back across alternate
//! providers on failure, executes any tool calls the model emits, and
//! unwinds plugin post hooks before returning a normalized response.
//!
//! The HTTP surface that frames requests into this schema, provider
//! catalogs beyond the bundled adapters, and configuration file parsing
//! are external collaborators.

pub mod adapter;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod fallback;
pub mod keys;
pub mod plugins;
pub mod pool;
pub mod tools;
pub mod transport;
pub mod types;
pub mod worker;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Error type for the library
pub mod error;
pub use error::{AttemptRecord, ErrorKind, GatewayError};

// Re-export main types for convenience
pub use adapter::{AnthropicAdapter, Capability, OpenAiAdapter, ProviderAdapter};
pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use config::{KeyConfig, ProviderConfig, SecretRef};
pub use engine::{GatewayBuilder, GatewayEngine, RequestContext};
pub use plugins::{Plugin, PluginContext, PluginPipeline, PreOutcome};
pub use tools::{McpHttpSource, ToolDescriptor, ToolFilters, ToolManager, ToolOutcome, ToolSource};
pub use transport::build_http_client;
pub use types::{
    ChatRequest, ChatResponse, FinishReason, GenerationParams, Message, MessageRole, ModelTarget,
    ToolCall, ToolDefinition,
};
