//! JSON-RPC 2.0 messages and MCP result shapes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::bridge::ToolOutcome;
use crate::reconcile::ToolDef;
use crate::types::Error;

pub const JSONRPC_VERSION: &str = "2.0";
/// MCP revision spoken by the session front.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const RPC_PARSE_ERROR: i64 = -32700;
pub const RPC_INVALID_REQUEST: i64 = -32600;
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
const RPC_INTERNAL_ERROR: i64 = -32603;

/// Incoming request or notification. Notifications carry no `id` member;
/// `"id": null` is a request and gets a reply.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, deserialize_with = "present_id")]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

fn present_id<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl JsonRpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// Outgoing response. The result is kept encoded so declared schemas reach
/// the client byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Box<RawValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success<T: Serialize>(id: Value, result: &T) -> Self {
        match serde_json::value::to_raw_value(result) {
            Ok(raw) => Self {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result: Some(raw),
                error: None,
            },
            Err(e) => Self::failure(id, RPC_INTERNAL_ERROR, format!("result encode error: {}", e)),
        }
    }

    pub fn failure(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn from_error(id: Value, err: &Error) -> Self {
        Self::failure(id, err.to_rpc_code(), err.to_string())
    }

    /// Encoded message for the session stream.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            json!({
                "jsonrpc": JSONRPC_VERSION,
                "id": self.id,
                "error": {"code": RPC_INTERNAL_ERROR, "message": e.to_string()},
            })
            .to_string()
        })
    }
}

/// `tools/call` params.
#[derive(Debug, Clone, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
    #[serde(default, rename = "_meta")]
    pub meta: Option<CallMeta>,
}

/// Optional call metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallMeta {
    /// Requested timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl CallToolParams {
    pub fn timeout(&self) -> Option<Duration> {
        self.meta
            .as_ref()
            .and_then(|m| m.timeout)
            .map(Duration::from_secs)
    }
}

pub fn initialize_result(server_name: &str, server_version: &str) -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {"tools": {"listChanged": false}},
        "serverInfo": {"name": server_name, "version": server_version},
    })
}

/// `tools/list` result; input schemas are written as declared.
#[derive(Debug, Serialize)]
pub struct ToolsList<'a> {
    tools: Vec<ToolEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct ToolEntry<'a> {
    name: &'a str,
    description: &'a str,
    #[serde(rename = "inputSchema")]
    input_schema: InputSchema<'a>,
}

/// Declared schema, or an empty object schema when undeclared.
#[derive(Debug)]
struct InputSchema<'a>(Option<&'a RawValue>);

impl Serialize for InputSchema<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Some(raw) => raw.serialize(serializer),
            None => json!({"type": "object"}).serialize(serializer),
        }
    }
}

pub fn tools_list_result(tools: &[ToolDef]) -> ToolsList<'_> {
    ToolsList {
        tools: tools
            .iter()
            .map(|t| ToolEntry {
                name: &t.name,
                description: &t.desc,
                input_schema: InputSchema(t.schema.as_deref()),
            })
            .collect(),
    }
}

pub fn call_tool_result(outcome: &ToolOutcome) -> Value {
    json!({
        "content": [{"type": "text", "text": outcome.text()}],
        "isError": outcome.is_error(),
    })
}
