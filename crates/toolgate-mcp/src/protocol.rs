//! JSON-RPC 2.0 envelopes and the MCP message shapes toolgate speaks.

use serde::{Deserialize, Serialize};
use toolgate_core::{ToolgateError, ToolgateResult};

/// Protocol version sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Client name sent in the `initialize` request.
pub const CLIENT_NAME: &str = "toolgate";

/// JSON-RPC method names.
pub mod methods {
    /// Handshake request.
    pub const INITIALIZE: &str = "initialize";
    /// Notification sent once the handshake result is stored.
    pub const INITIALIZED: &str = "notifications/initialized";
    /// Tool catalog request.
    pub const TOOLS_LIST: &str = "tools/list";
    /// Tool invocation request.
    pub const TOOLS_CALL: &str = "tools/call";
    /// Best-effort notification sent before the transport is released.
    pub const SHUTDOWN: &str = "shutdown";
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification: a request without an `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.into(),
            params,
        }
    }
}

/// An envelope on its way to a server.
#[derive(Debug, Clone)]
pub enum Outbound {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
}

impl Outbound {
    /// The request id, `None` for notifications.
    pub fn id(&self) -> Option<u64> {
        match self {
            Self::Request(req) => Some(req.id),
            Self::Notification(_) => None,
        }
    }

    pub fn method(&self) -> &str {
        match self {
            Self::Request(req) => &req.method,
            Self::Notification(note) => &note.method,
        }
    }

    /// Serialize to a single JSON line without the trailing newline.
    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            Self::Request(req) => serde_json::to_string(req),
            Self::Notification(note) => serde_json::to_string(note),
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: u64, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }

    /// Unwrap the `result`, turning an `error` object (or neither field) into
    /// a [`ToolgateError::Protocol`].
    pub fn into_result(self, server: &str) -> ToolgateResult<serde_json::Value> {
        if let Some(err) = self.error {
            return Err(ToolgateError::Protocol {
                server: server.to_string(),
                code: Some(err.code),
                message: err.message,
            });
        }
        self.result.ok_or_else(|| {
            ToolgateError::protocol(server, "response carries neither result nor error")
        })
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A tool as advertised by `tools/list`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// `tools/list` result body.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
}

/// `tools/call` result. `is_error` marks a tool-level failure that the server
/// reported correctly; it is data, not a transport or protocol error.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl ToolCallResult {
    /// All text blocks joined with newlines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// One content block of a tool result. Non-text blocks keep their extra
/// fields in `extra`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: Some(text.into()),
            extra: serde_json::Map::new(),
        }
    }
}

/// Server capabilities from the `initialize` response.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<serde_json::Value>,
}

/// `initialize` result body.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    #[serde(default, rename = "serverInfo", skip_serializing_if = "Option::is_none")]
    pub server_info: Option<ServerInfo>,
}

/// Server identity from the handshake.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Parameters of the `initialize` request.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
