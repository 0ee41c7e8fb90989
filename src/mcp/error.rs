//! MCP 传输与调用错误

use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON-RPC error 响应
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// 工具返回 isError=true
    #[error("Tool error: {0}")]
    ToolFailed(String),

    /// 连续重连失败超过预算，需手动 reset
    #[error("Reconnect budget exhausted for {server} after {attempts} attempts")]
    ReconnectBudgetExhausted { server: String, attempts: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_tungstenite::tungstenite::Error> for McpError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        McpError::WebSocket(err.to_string())
    }
}

impl McpError {
    /// 是否为连接层失败（触发重连）
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            McpError::Connection(_)
                | McpError::NotConnected(_)
                | McpError::Io(_)
                | McpError::WebSocket(_)
                | McpError::Timeout(_)
        ) || matches!(self, McpError::Http(e) if e.is_connect() || e.is_timeout())
    }
}
