//! MCP 工具编排模块 — 请求前的工具发现注入与响应后的工具调用执行
//!
//! Tool augmentation. External tool sources (MCP clients) advertise
//! catalogs of `(name, schema)`; before dispatch the manager materializes
//! the effective tool set into the request, and after a response carrying
//! tool calls it executes them and feeds the results back as `tool` role
//! messages.
//!
//! Tool names are namespaced `mcp__<source>__<name>` so catalogs from
//! multiple sources never collide, and so a call can be routed back to
//! its owning source.

mod manager;
mod mcp;

pub use manager::{ToolFilters, ToolManager, DEFAULT_TOOL_CONCURRENCY, DEFAULT_TOOL_ROUNDS};
pub use mcp::McpHttpSource;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::types::ToolCall;
use crate::Result;

/// One advertised tool: name plus JSON Schema for its input.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: Option<String>,
    pub schema: Option<serde_json::Value>,
}

/// What a tool invocation produced.
///
/// Both variants become tool-message content. Source unreachability is
/// the only thing that surfaces as a request error, and it travels as
/// `Err` from [`ToolSource::invoke`].
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    Success(String),
    /// The tool ran and reported an error (MCP `isError`).
    Failure(String),
}

/// External catalog + executor for callable tools.
#[async_trait]
pub trait ToolSource: Send + Sync {
    /// Stable source name used in namespacing and filters.
    fn name(&self) -> &str;

    /// Advertise the catalog. Cancellable.
    async fn list_tools(&self, cancel: &CancelToken) -> Result<Vec<ToolDescriptor>>;

    /// Invoke one tool call (bare name, namespace already stripped).
    /// `Err` means the source itself was unreachable.
    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> Result<ToolOutcome>;
}
