//! HTTP MCP client: a [`ToolSource`] speaking JSON-RPC 2.0 over
//! streamable HTTP (`tools/list`, `tools/call`).

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::cancel::CancelToken;
use crate::error::GatewayError;
use crate::types::ToolCall;
use crate::Result;

use super::{ToolDescriptor, ToolOutcome, ToolSource};

/// An MCP tool as received from a server's `tools/list` response.
#[derive(Debug, Clone, Deserialize)]
struct McpTool {
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct McpToolList {
    #[serde(default)]
    tools: Vec<McpTool>,
}

/// MCP content block within a tool result.
#[derive(Debug, Clone, Deserialize)]
struct McpContent {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    content_type: String,
    #[serde(default)]
    text: Option<String>,
}

/// An MCP tool invocation result.
#[derive(Debug, Deserialize)]
struct McpCallResult {
    #[serde(default)]
    content: Vec<McpContent>,
    #[serde(default, rename = "isError")]
    is_error: bool,
}

/// MCP server reachable over HTTP.
pub struct McpHttpSource {
    name: String,
    endpoint: String,
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl McpHttpSource {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            client,
            bearer_token: None,
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    async fn rpc(&self, method: &str, params: Value, cancel: &CancelToken) -> Result<Value> {
        cancel.check()?;

        let body = json!({
            "jsonrpc": "2.0",
            "id": uuid::Uuid::new_v4().to_string(),
            "method": method,
            "params": params,
        });

        let mut req = self.client.post(&self.endpoint).json(&body);
        if let Some(token) = &self.bearer_token {
            req = req.bearer_auth(token);
        }

        let send = async {
            let resp = req.send().await.map_err(|e| {
                GatewayError::tool_execution(format!(
                    "MCP source '{}' unreachable: {}",
                    self.name, e
                ))
            })?;
            if !resp.status().is_success() {
                return Err(GatewayError::tool_execution(format!(
                    "MCP source '{}' returned HTTP {}",
                    self.name,
                    resp.status().as_u16()
                )));
            }
            resp.json::<Value>().await.map_err(|e| {
                GatewayError::tool_execution(format!(
                    "MCP source '{}' sent invalid JSON: {}",
                    self.name, e
                ))
            })
        };

        let envelope = tokio::select! {
            _ = cancel.cancelled() => return Err(GatewayError::canceled()),
            out = send => out?,
        };

        if let Some(err) = envelope.get("error") {
            return Err(GatewayError::tool_execution(format!(
                "MCP source '{}' RPC error: {}",
                self.name, err
            )));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl ToolSource for McpHttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self, cancel: &CancelToken) -> Result<Vec<ToolDescriptor>> {
        let result = self.rpc("tools/list", json!({}), cancel).await?;
        let list: McpToolList = serde_json::from_value(result).map_err(|e| {
            GatewayError::tool_execution(format!(
                "MCP source '{}' tools/list malformed: {}",
                self.name, e
            ))
        })?;
        Ok(list
            .tools
            .into_iter()
            .map(|t| ToolDescriptor {
                name: t.name,
                description: t.description,
                schema: t.input_schema,
            })
            .collect())
    }

    async fn invoke(&self, call: &ToolCall, cancel: &CancelToken) -> Result<ToolOutcome> {
        let result = self
            .rpc(
                "tools/call",
                json!({ "name": call.name, "arguments": call.arguments }),
                cancel,
            )
            .await?;
        let parsed: McpCallResult = serde_json::from_value(result).map_err(|e| {
            GatewayError::tool_execution(format!(
                "MCP source '{}' tools/call malformed: {}",
                self.name, e
            ))
        })?;

        let text = parsed
            .content
            .iter()
            .filter_map(|c| c.text.clone())
            .collect::<Vec<_>>()
            .join("\n");

        if parsed.is_error {
            Ok(ToolOutcome::Failure(text))
        } else {
            Ok(ToolOutcome::Success(text))
        }
    }
}
