//! MCP JSON-RPC endpoint
//!
//! Only the federation-facing tools live here: cluster discovery and
//! resolving an authenticated client for a cluster. Kubernetes resource
//! tools sit on top of [`Manager::client`](crate::federation::Manager::client).

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::router::AppState;
use crate::federation::validation::anonymize_email;
use crate::federation::{FederationError, Manager, RequestContext};

/// MCP protocol version implemented by this endpoint
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// JSON-RPC error codes
pub mod codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;
    /// Not a valid request object
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method does not exist
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters
    pub const INVALID_PARAMS: i32 = -32602;
}

/// Request ID (string or number)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// String ID
    String(String),
    /// Numeric ID
    Number(i64),
}

/// JSON-RPC request; `id` is absent on notifications
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Always "2.0"
    pub jsonrpc: String,
    /// Request ID
    #[serde(default)]
    pub id: Option<RequestId>,
    /// Method name
    pub method: String,
    /// Parameters
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    /// Error code
    pub code: i32,
    /// Error message
    pub message: String,
}

/// JSON-RPC response
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    /// Always "2.0"
    pub jsonrpc: &'static str,
    /// Request ID
    pub id: Option<RequestId>,
    /// Result (on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Success response
    #[must_use]
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response
    pub fn error(id: Option<RequestId>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "list_clusters",
            "description": "List the workload clusters (CAPI) visible to you on the management cluster",
            "inputSchema": { "type": "object", "properties": {} }
        },
        {
            "name": "cluster_summary",
            "description": "Show status, provider, release and Kubernetes version of one workload cluster",
            "inputSchema": {
                "type": "object",
                "properties": { "name": { "type": "string", "description": "Cluster name" } },
                "required": ["name"]
            }
        },
        {
            "name": "connect_cluster",
            "description": "Resolve an authenticated client for a cluster; an empty name is the management cluster",
            "inputSchema": {
                "type": "object",
                "properties": { "cluster": { "type": "string", "description": "Cluster name" } }
            }
        }
    ])
}

/// `POST /mcp`
pub async fn mcp_handler(
    State(state): State<Arc<AppState>>,
    ctx: Option<Extension<RequestContext>>,
    body: axum::body::Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            debug!(error = %e, "Unparseable JSON-RPC body");
            return Json(JsonRpcResponse::error(None, codes::PARSE_ERROR, "parse error")).into_response();
        }
    };
    if request.jsonrpc != "2.0" {
        return Json(JsonRpcResponse::error(request.id, codes::INVALID_REQUEST, "jsonrpc must be \"2.0\""))
            .into_response();
    }
    if request.id.is_none() {
        return StatusCode::ACCEPTED.into_response();
    }

    let ctx = ctx.map(|Extension(c)| c);
    let id = request.id.clone();
    let response = match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": { "tools": { "listChanged": false } },
                "serverInfo": { "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") }
            }),
        ),
        "ping" => JsonRpcResponse::success(id, json!({})),
        "tools/list" => JsonRpcResponse::success(id, json!({ "tools": tool_definitions() })),
        "tools/call" => {
            let call: ToolCall = match request.params.map(serde_json::from_value).transpose() {
                Ok(Some(call)) => call,
                _ => return Json(JsonRpcResponse::error(id, codes::INVALID_PARAMS, "tool name is required")).into_response(),
            };
            match call_tool(state.federation.as_deref(), ctx.as_ref(), &call).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err((code, message)) => JsonRpcResponse::error(id, code, message),
            }
        }
        other => JsonRpcResponse::error(id, codes::METHOD_NOT_FOUND, format!("method '{other}' not found")),
    };
    Json(response).into_response()
}

fn text_result(value: &impl Serialize) -> Value {
    let text = serde_json::to_string_pretty(value).unwrap_or_default();
    json!({ "content": [{ "type": "text", "text": text }], "isError": false })
}

fn tool_error(message: &str) -> Value {
    json!({ "content": [{ "type": "text", "text": message }], "isError": true })
}

fn federation_failure(tool: &str, ctx: &RequestContext, err: &FederationError) -> Value {
    if err.is_forbidden() {
        debug!(tool, user_hash = %anonymize_email(&ctx.user.email), error = %err, "Tool call denied");
    } else {
        warn!(tool, user_hash = %anonymize_email(&ctx.user.email), error = %err, "Tool call failed");
    }
    tool_error(&err.user_facing_message())
}

fn string_arg<'a>(args: &'a Value, name: &str) -> Option<&'a str> {
    args.get(name).and_then(Value::as_str)
}

async fn call_tool(
    manager: Option<&Manager>,
    ctx: Option<&RequestContext>,
    call: &ToolCall,
) -> Result<Value, (i32, String)> {
    if !matches!(call.name.as_str(), "list_clusters" | "cluster_summary" | "connect_cluster") {
        return Err((codes::METHOD_NOT_FOUND, format!("unknown tool '{}'", call.name)));
    }
    let Some(manager) = manager else {
        return Ok(tool_error("multi-cluster federation is not enabled"));
    };
    let Some(ctx) = ctx else {
        return Ok(tool_error("authentication required"));
    };

    let result = match call.name.as_str() {
        "list_clusters" => manager.list_clusters(ctx).await.map(|c| text_result(&c)),
        "cluster_summary" => {
            let Some(name) = string_arg(&call.arguments, "name") else {
                return Err((codes::INVALID_PARAMS, "argument 'name' is required".to_string()));
            };
            manager.cluster_summary(name, ctx).await.map(|s| text_result(&s))
        }
        _ => {
            let cluster = string_arg(&call.arguments, "cluster").unwrap_or_default();
            manager.client(cluster, ctx).await.map(|client| {
                text_result(&json!({
                    "cluster": client.cluster(),
                    "host": client.host(),
                    "auth": client.auth(),
                }))
            })
        }
    };
    Ok(result.unwrap_or_else(|e| federation_failure(&call.name, ctx, &e)))
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;

    fn state() -> Arc<AppState> {
        Arc::new(AppState {
            oauth: None,
            federation: None,
            shutdown: CancellationToken::new(),
            max_body_size: 1 << 20,
            request_timeout: std::time::Duration::from_secs(5),
            allowed_origins: Vec::new(),
            hsts: false,
            #[cfg(feature = "metrics")]
            prometheus: None,
        })
    }

    async fn call(body: Value) -> Value {
        let response = mcp_handler(State(state()), None, axum::body::Bytes::from(body.to_string())).await;
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn initialize_advertises_tools() {
        let response = call(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"})).await;
        assert_eq!(response["result"]["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(response["id"], 1);
    }

    #[tokio::test]
    async fn tools_list_names_federation_tools() {
        let response = call(json!({"jsonrpc": "2.0", "id": "a", "method": "tools/list"})).await;
        let names: Vec<&str> = response["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert_eq!(names, vec!["list_clusters", "cluster_summary", "connect_cluster"]);
    }

    #[tokio::test]
    async fn tool_without_federation_is_a_tool_error() {
        // GIVEN: federation disabled
        // WHEN
        let response = call(json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "list_clusters", "arguments": {}}
        }))
        .await;

        // THEN: reported in-band, not as a protocol error
        assert_eq!(response["result"]["isError"], true);
    }

    #[tokio::test]
    async fn unknown_method_and_tool() {
        let response = call(json!({"jsonrpc": "2.0", "id": 3, "method": "resources/list"})).await;
        assert_eq!(response["error"]["code"], codes::METHOD_NOT_FOUND);

        let response = call(json!({
            "jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {"name": "delete_cluster"}
        }))
        .await;
        assert_eq!(response["error"]["code"], codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_body() {
        let response = mcp_handler(
            State(state()),
            None,
            axum::body::Bytes::from(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn garbage_is_a_parse_error() {
        let response = mcp_handler(State(state()), None, axum::body::Bytes::from_static(b"{not json")).await;
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], codes::PARSE_ERROR);
    }
}
