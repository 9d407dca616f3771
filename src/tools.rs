//! Tool definitions and the MCP-backed provider/executor.
//!
//! Tools flow in exactly one direction per turn: either to the primary model
//! (tools enabled, supervisor off) or to the supervisor's reasoning pass.
//! The orchestrator only ever sees the traits; the MCP wiring is one
//! implementation of them.

use anyhow::{Context, Result};
use async_openai::types::{ChatCompletionTool, ChatCompletionToolArgs, FunctionObjectArgs};
use async_trait::async_trait;
use rmcp::model::{CallToolRequestParam, RawContent};
use rmcp::service::{DynService, RoleClient, RunningService};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

/// Connected MCP client services keyed by server id.
pub type ClientMap =
    HashMap<String, Arc<RunningService<RoleClient, Box<dyn DynService<RoleClient>>>>>;

/// One callable tool, in the shape both the realtime session and the
/// supervisor's chat API can consume.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments, normalized to an object schema.
    pub parameters: Value,
}

impl ToolDefinition {
    /// Flat function form used inside the realtime `session.update`.
    pub fn to_realtime_value(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "name": self.name,
            "description": self.description,
            "parameters": self.parameters,
        })
    }

    /// Nested function form for the supervisor's chat-completions request.
    pub fn to_chat_tool(&self) -> Result<ChatCompletionTool> {
        Ok(ChatCompletionToolArgs::default()
            .function(
                FunctionObjectArgs::default()
                    .name(self.name.clone())
                    .description(self.description.clone())
                    .parameters(self.parameters.clone())
                    .build()?,
            )
            .build()?)
    }
}

/// Supplies the current list of callable tool schemas. The orchestrator
/// requests this once per connect/config-change cycle and falls back to an
/// empty list when the provider fails.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>>;
}

/// Executes one tool call and returns its textual result.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String>;
}

/// A provider/executor pair over connected MCP servers. Tool names are
/// namespaced as `mcp__{server}__{tool}` so a call can be routed back to the
/// server that owns it.
pub struct McpToolset {
    clients: Arc<AsyncMutex<ClientMap>>,
}

impl McpToolset {
    pub fn new(clients: Arc<AsyncMutex<ClientMap>>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl ToolProvider for McpToolset {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        let snapshot: Vec<(String, Arc<_>)> = {
            let map = self.clients.lock().await;
            map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };

        let mut out = Vec::new();
        for (server_id, svc) in snapshot {
            let tools = match svc.list_all_tools().await {
                Ok(tools) => tools,
                Err(e) => {
                    tracing::warn!(server_id, error = %e, "tool listing failed; skipping server");
                    continue;
                }
            };
            for tool in tools {
                let name = sanitize_fn_name(&format!("mcp__{}__{}", server_id, tool.name));
                let parameters = normalize_schema(serde_json::to_value(&*tool.input_schema)?);
                out.push(ToolDefinition {
                    name,
                    description: tool
                        .description
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| format!("Tool from MCP server '{server_id}'")),
                    parameters,
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl ToolExecutor for McpToolset {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<String> {
        let (server_id, tool_name) =
            parse_namespaced_name(name).with_context(|| format!("unroutable tool name: {name}"))?;
        let svc = {
            let map = self.clients.lock().await;
            map.get(&server_id).cloned()
        }
        .with_context(|| format!("no connected MCP server '{server_id}'"))?;

        let result = svc
            .call_tool(CallToolRequestParam {
                name: tool_name.into(),
                arguments: arguments.as_object().cloned(),
            })
            .await
            .with_context(|| format!("call_tool '{name}' failed"))?;

        let annotated = result
            .content
            .context("tool call returned no content")?
            .pop()
            .context("tool content list was empty")?;
        match annotated.raw {
            RawContent::Text(text_content) => Ok(text_content.text),
            _ => Ok("{\"error\": \"unexpected content type from tool\"}".to_string()),
        }
    }
}

/// Restricts a function name to the character set the provider accepts.
pub fn sanitize_fn_name(s: &str) -> String {
    s.chars()
        .map(|ch| match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => ch,
            _ => '_',
        })
        .collect()
}

/// Splits a namespaced `mcp__{server}__{tool}` name back into its parts.
pub fn parse_namespaced_name(name: &str) -> Option<(String, String)> {
    let rest = name.strip_prefix("mcp__")?;
    let idx = rest.find("__")?;
    let (server, tool) = (&rest[..idx], &rest[idx + 2..]);
    if server.is_empty() || tool.is_empty() {
        return None;
    }
    Some((server.to_string(), tool.to_string()))
}

/// Coerces whatever schema a server advertised into a usable object schema.
pub fn normalize_schema(schema: Value) -> Value {
    let mut obj = match schema {
        Value::Object(obj) => obj,
        _ => serde_json::Map::new(),
    };
    obj.entry("type").or_insert_with(|| Value::from("object"));
    obj.entry("properties")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    obj.entry("additionalProperties")
        .or_insert_with(|| Value::from(true));
    Value::Object(obj)
}

/// A provider with no tools; used when tool access is disabled entirely.
pub struct NoTools;

#[async_trait]
impl ToolProvider for NoTools {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl ToolExecutor for NoTools {
    async fn call_tool(&self, name: &str, _arguments: Value) -> Result<String> {
        anyhow::bail!("no tool backend configured (call to '{name}')")
    }
}
