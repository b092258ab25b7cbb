//! MCP protocol server and the process-wide server singleton.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crm_mcp_core::{ExecutionCapability, NotificationSink};
use crm_mcp_executor::{CapabilityError, ToolSpec};
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::OnceCell;

use crate::protocol::{
    ClientMessage, INITIALIZE_METHOD, JsonRpcResponse, LogLevel, SUPPORTED_PROTOCOL_VERSIONS,
    codes,
};

/// Server name reported during `initialize`.
pub const SERVER_NAME: &str = "crm-mcp-gateway";

/// Error constructing the protocol server.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Execution capability unavailable: {0}")]
    Capability(#[from] CapabilityError),
    #[error("Tool registered twice: {0}")]
    DuplicateTool(String),
}

/// A registered tool.
#[derive(Debug, Clone)]
pub struct Tool {
    pub spec: ToolSpec,
    pub input_schema: Value,
}

impl Tool {
    fn describe(&self) -> Value {
        json!({
            "name": self.spec.name(),
            "description": self.spec.description,
            "inputSchema": self.input_schema,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ToolCallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitializeParams {
    protocol_version: String,
}

/// MCP server: tool registry bound to an execution capability.
///
/// Built once per process and shared by every session.
pub struct McpServer {
    tools: BTreeMap<String, Tool>,
    capability: Arc<dyn ExecutionCapability>,
}

impl fmt::Debug for McpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpServer")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl McpServer {
    /// Create a server with no tools.
    #[must_use]
    pub fn new(capability: Arc<dyn ExecutionCapability>) -> Self {
        Self {
            tools: BTreeMap::new(),
            capability,
        }
    }

    /// Create a server exposing every tool in `catalog`.
    ///
    /// # Errors
    /// Returns error if two catalog entries share a tool name.
    pub fn with_catalog(
        capability: Arc<dyn ExecutionCapability>,
        catalog: impl IntoIterator<Item = ToolSpec>,
    ) -> Result<Self, BuildError> {
        let mut server = Self::new(capability);
        for spec in catalog {
            server.register_tool(spec)?;
        }
        tracing::info!(tools = server.tool_count(), "MCP server constructed");
        Ok(server)
    }

    /// Register a tool for a domain operation.
    ///
    /// # Errors
    /// Returns error if a tool with the same name already exists.
    pub fn register_tool(&mut self, spec: ToolSpec) -> Result<(), BuildError> {
        let name = spec.name();
        if self.tools.contains_key(&name) {
            return Err(BuildError::DuplicateTool(name));
        }
        let tool = Tool {
            spec,
            input_schema: json!({"type": "object", "additionalProperties": true}),
        };
        self.tools.insert(name, tool);
        Ok(())
    }

    #[must_use]
    pub fn tool_count(&self) -> usize {
        self.tools.len()
    }

    /// Handle one client message. Notifications and client responses get no reply.
    pub async fn handle(
        &self,
        message: &ClientMessage,
        sink: &dyn NotificationSink,
    ) -> Option<JsonRpcResponse> {
        let Some(method) = message.method() else {
            tracing::debug!(id = ?message.id, "Ignoring client response");
            return None;
        };
        if !message.is_request() {
            tracing::debug!(method, "Received notification");
            return None;
        }

        let id = message.id.clone();
        let params = message.params.clone().unwrap_or_else(|| json!({}));
        tracing::debug!(method, "Handling request");

        let response = match method {
            INITIALIZE_METHOD => Self::initialize(id, params),
            "ping" => JsonRpcResponse::success(id, json!({})),
            "tools/list" => JsonRpcResponse::success(id, self.list_tools()),
            "tools/call" => self.call_tool(id, params, sink).await,
            "logging/setLevel" => match serde_json::from_value::<LogLevel>(params["level"].clone()) {
                Ok(_) => JsonRpcResponse::success(id, json!({})),
                Err(e) => JsonRpcResponse::error(id, codes::INVALID_PARAMS, format!("Invalid level: {e}")),
            },
            _ => JsonRpcResponse::error(id, codes::METHOD_NOT_FOUND, format!("Method not found: {method}")),
        };
        Some(response)
    }

    fn initialize(id: Option<Value>, params: Value) -> JsonRpcResponse {
        let params: InitializeParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return JsonRpcResponse::error(
                    id,
                    codes::INVALID_PARAMS,
                    format!("Invalid initialize params: {e}"),
                );
            }
        };

        let version = SUPPORTED_PROTOCOL_VERSIONS
            .iter()
            .find(|v| **v == params.protocol_version)
            .unwrap_or(&SUPPORTED_PROTOCOL_VERSIONS[0]);

        JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": version,
                "capabilities": {
                    "tools": {"listChanged": false},
                    "logging": {},
                },
                "serverInfo": {
                    "name": SERVER_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
    }

    fn list_tools(&self) -> Value {
        let tools: Vec<Value> = self.tools.values().map(Tool::describe).collect();
        json!({ "tools": tools })
    }

    async fn call_tool(
        &self,
        id: Option<Value>,
        params: Value,
        sink: &dyn NotificationSink,
    ) -> JsonRpcResponse {
        let params: ToolCallParams = match serde_json::from_value(params) {
            Ok(p) => p,
            Err(e) => {
                return JsonRpcResponse::error(id, codes::INVALID_PARAMS, format!("Invalid tool call: {e}"));
            }
        };
        let Some(tool) = self.tools.get(&params.name) else {
            return JsonRpcResponse::error(
                id,
                codes::INVALID_PARAMS,
                format!("Unknown tool: {}", params.name),
            );
        };

        let arguments = params.arguments.unwrap_or_else(|| json!({}));
        let outcome = self
            .capability
            .execute(&tool.spec.domain, &tool.spec.operation, arguments)
            .await;

        let result = match outcome {
            Ok(value) => {
                sink.notify(
                    "notifications/message",
                    json!({
                        "level": LogLevel::Info,
                        "logger": SERVER_NAME,
                        "data": {"tool": params.name, "status": "ok"},
                    }),
                );
                let text = serde_json::to_string_pretty(&value).unwrap_or_default();
                let mut result = json!({
                    "content": [{"type": "text", "text": text}],
                    "isError": false,
                });
                if value.is_object() {
                    result["structuredContent"] = value;
                }
                result
            }
            Err(e) => {
                tracing::info!(tool = %params.name, error = %e, "Tool call failed upstream");
                let error = serde_json::to_value(&e).unwrap_or(Value::Null);
                sink.notify(
                    "notifications/message",
                    json!({
                        "level": LogLevel::Error,
                        "logger": SERVER_NAME,
                        "data": {"tool": params.name, "status": "error", "error": error},
                    }),
                );
                json!({
                    "content": [{"type": "text", "text": error.to_string()}],
                    "isError": true,
                })
            }
        };
        JsonRpcResponse::success(id, result)
    }
}

/// Builds the server on first use. Called at most once per successful build.
pub type ServerFactory = Box<dyn Fn() -> Result<McpServer, BuildError> + Send + Sync>;

/// Lazily constructed, process-wide `McpServer`.
///
/// Concurrent first callers wait on the same construction. A failed
/// construction is not cached; the next caller retries from scratch.
pub struct ServerSingleton {
    cell: OnceCell<Arc<McpServer>>,
    factory: ServerFactory,
}

impl ServerSingleton {
    #[must_use]
    pub fn new(factory: ServerFactory) -> Self {
        Self {
            cell: OnceCell::new(),
            factory,
        }
    }

    /// Return the shared server, constructing it if needed.
    ///
    /// # Errors
    /// Returns the factory's error; nothing is cached on failure.
    pub async fn get_or_create(&self) -> Result<Arc<McpServer>, BuildError> {
        self.cell
            .get_or_try_init(|| async {
                tracing::info!("Constructing shared MCP server");
                (self.factory)().map(Arc::new).inspect_err(|e| {
                    tracing::error!(error = %e, "MCP server construction failed");
                })
            })
            .await
            .map(Arc::clone)
    }

    /// Whether construction has succeeded.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}
