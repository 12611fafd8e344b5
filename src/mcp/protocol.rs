//! JSON-RPC envelopes and MCP payload parsing.
//!
//! The types here are deliberately lenient: session ids travel in the
//! initialize result body, endpoint events may be JSON objects or bare
//! strings, and tool results come back as strings, arrays of content blocks,
//! or arbitrary objects depending on the server. Everything is normalized at
//! this boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::ChatToolDefinition;

pub const JSONRPC_VERSION: &str = "2.0";
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: i64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    /// Notifications carry no id and expect no reply.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: None,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    /// The numeric request id this reply correlates to, if any. Ids are kept
    /// numeric end to end so send and receive paths share one key space.
    pub fn numeric_id(&self) -> Option<i64> {
        self.id.as_ref().and_then(Value::as_i64)
    }

    pub fn into_result(self) -> Result<Value, String> {
        if let Some(error) = self.error {
            return Err(format_rpc_error(&error));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }

    pub fn is_method_not_found(&self) -> bool {
        self.error
            .as_ref()
            .is_some_and(|error| error.code == METHOD_NOT_FOUND)
    }
}

pub fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| data.as_str().map(str::to_string))
            .or_else(|| serde_json::to_string_pretty(data).ok());
        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}

pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "banter",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

#[derive(Debug, Default, Clone)]
pub struct InitializeOutcome {
    pub session_id: Option<String>,
    pub protocol_version: Option<String>,
    pub server_name: Option<String>,
}

pub fn parse_initialize(result: &Value) -> InitializeOutcome {
    InitializeOutcome {
        session_id: result
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string),
        protocol_version: result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .map(str::to_string),
        server_name: result
            .pointer("/serverInfo/name")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Convert a `tools/list` result into the common tool-definition shape,
/// defaulting an absent input schema to an empty object schema.
pub fn parse_tools_list(result: &Value) -> Result<Vec<ChatToolDefinition>, String> {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .ok_or_else(|| "tools/list result missing tools array".to_string())?;

    let mut definitions = Vec::with_capacity(tools.len());
    for tool in tools {
        let name = tool
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| "tool descriptor missing name".to_string())?;
        let description = tool
            .get("description")
            .and_then(Value::as_str)
            .map(str::to_string);
        let parameters = tool
            .get("inputSchema")
            .cloned()
            .unwrap_or_else(empty_object_schema);
        definitions.push(ChatToolDefinition::function(name, description, parameters));
    }
    Ok(definitions)
}

/// Shape a tool result's content takes on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text(String),
    Blocks(Vec<Value>),
    Structured(Value),
}

impl ToolContent {
    pub fn classify(result: &Value) -> Self {
        match result.get("content") {
            Some(Value::String(text)) => ToolContent::Text(text.clone()),
            Some(Value::Array(blocks)) => ToolContent::Blocks(blocks.clone()),
            Some(other) => ToolContent::Structured(other.clone()),
            None => ToolContent::Structured(result.clone()),
        }
    }

    /// Render to a single string: blocks joined on their text fields,
    /// structured content JSON-encoded.
    pub fn render(&self) -> String {
        match self {
            ToolContent::Text(text) => text.clone(),
            ToolContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block.get("text").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => block.to_string(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
            ToolContent::Structured(value) => value.to_string(),
        }
    }
}

/// Extract the textual content of a `tools/call` result.
pub fn normalize_tool_result(result: &Value) -> String {
    ToolContent::classify(result).render()
}
