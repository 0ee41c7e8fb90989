//! JSON-RPC 2.0 消息与 MCP 方法（initialize / notifications/initialized / tools/list / tools/call）

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::McpError;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const CLIENT_NAME: &str = "hive";

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";

/// 请求（id 为 None 时是通知）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: Some(params),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// 响应；服务端发来的通知也会被解析为此结构（id 为空）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
    /// 通知 / 服务端请求携带 method
    #[serde(default)]
    pub method: Option<String>,
}

impl JsonRpcResponse {
    /// 是否为对 `id` 的响应
    pub fn answers(&self, id: u64) -> bool {
        self.method.is_none() && self.id.as_ref().and_then(Value::as_u64) == Some(id)
    }

    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

/// 服务端工具定义
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// initialize 返回的服务端信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol_version: String,
}

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

pub fn parse_server_info(result: &Value) -> ServerInfo {
    let info = &result["serverInfo"];
    ServerInfo {
        name: info["name"].as_str().unwrap_or("unknown").to_string(),
        version: info["version"].as_str().unwrap_or_default().to_string(),
        protocol_version: result["protocolVersion"]
            .as_str()
            .unwrap_or(PROTOCOL_VERSION)
            .to_string(),
    }
}

pub fn parse_tools(result: Value) -> Result<Vec<McpToolDefinition>, McpError> {
    let tools = result
        .get("tools")
        .cloned()
        .ok_or_else(|| McpError::Protocol("tools/list result missing 'tools'".to_string()))?;
    Ok(serde_json::from_value(tools)?)
}

pub fn call_params(name: &str, arguments: Value) -> Value {
    json!({ "name": name, "arguments": arguments })
}

/// 拼接 tools/call 结果中的文本块
pub fn result_text(result: &Value) -> String {
    match result.get("content").and_then(Value::as_array) {
        Some(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        None => result.to_string(),
    }
}

/// isError=true 的结果转为错误
pub fn check_tool_result(result: Value) -> Result<Value, McpError> {
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(McpError::ToolFailed(result_text(&result)));
    }
    Ok(result)
}

/// 从 SSE 响应体中找出对 `id` 的 JSON-RPC 响应
pub fn parse_sse_response(body: &str, id: u64) -> Result<JsonRpcResponse, McpError> {
    let mut data = String::new();
    let mut events = Vec::new();
    for line in body.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.trim_start());
        } else if line.trim().is_empty() && !data.is_empty() {
            events.push(std::mem::take(&mut data));
        }
    }
    if !data.is_empty() {
        events.push(data);
    }

    events
        .iter()
        .filter_map(|e| serde_json::from_str::<JsonRpcResponse>(e).ok())
        .find(|r| r.answers(id))
        .ok_or_else(|| McpError::Protocol(format!("no response for request {} in event stream", id)))
}
