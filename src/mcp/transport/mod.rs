//! MCP 传输层
//!
//! 三种传输（stdio 子进程 / HTTP / WebSocket）都只实现 RpcChannel（打开、请求、通知、关闭）；
//! 握手、超时、工具调用结果检查由 RpcTransport 统一完成，对外暴露一致的 McpTransport 契约。

pub mod http;
pub mod stdio;
pub mod websocket;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::error::McpError;
use super::protocol::{self, McpToolDefinition, ServerInfo};
use super::types::{ServerConnectionConfig, TransportKind};

pub use http::HttpChannel;
pub use stdio::StdioChannel;
pub use websocket::WebSocketChannel;

/// 统一传输契约；由单个服务器 Actor 独占
#[async_trait]
pub trait McpTransport: Send {
    /// 建立连接并完成 initialize 握手
    async fn connect(&mut self, timeout: Duration) -> bool;

    async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>, McpError>;

    async fn call_tool(&mut self, name: &str, args: Value, timeout: Duration) -> Result<Value, McpError>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn server_info(&self) -> Option<ServerInfo>;

    fn last_error(&self) -> Option<String>;
}

/// 按配置创建传输客户端（重连时整体替换）
pub trait TransportFactory: Send + Sync {
    fn create(&self, config: &ServerConnectionConfig) -> Box<dyn McpTransport>;
}

/// 按 TransportKind 选择实现
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn create(&self, config: &ServerConnectionConfig) -> Box<dyn McpTransport> {
        match config.transport {
            TransportKind::Stdio { .. } => Box::new(RpcTransport::<StdioChannel>::new(config.clone())),
            TransportKind::Http { .. } => Box::new(RpcTransport::<HttpChannel>::new(config.clone())),
            TransportKind::WebSocket { .. } => Box::new(RpcTransport::<WebSocketChannel>::new(config.clone())),
        }
    }
}

/// 单条 JSON-RPC 通道
#[async_trait]
pub trait RpcChannel: Send + Sized {
    async fn open(config: &ServerConnectionConfig) -> Result<Self, McpError>;

    async fn request(&mut self, id: u64, method: &str, params: Value) -> Result<Value, McpError>;

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), McpError>;

    async fn close(&mut self);
}

/// 通道之上的 MCP 客户端
pub struct RpcTransport<C: RpcChannel> {
    config: ServerConnectionConfig,
    channel: Option<C>,
    next_id: u64,
    server_info: Option<ServerInfo>,
    last_error: Option<String>,
}

impl<C: RpcChannel> RpcTransport<C> {
    pub fn new(config: ServerConnectionConfig) -> Self {
        Self {
            config,
            channel: None,
            next_id: 1,
            server_info: None,
            last_error: None,
        }
    }

    async fn open_and_handshake(config: &ServerConnectionConfig) -> Result<(C, ServerInfo), McpError> {
        let mut channel = C::open(config).await?;
        let result = channel
            .request(0, protocol::METHOD_INITIALIZE, protocol::initialize_params())
            .await?;
        channel.notify(protocol::METHOD_INITIALIZED, json!({})).await?;
        Ok((channel, protocol::parse_server_info(&result)))
    }

    async fn request(&mut self, method: &str, params: Value, timeout: Duration) -> Result<Value, McpError> {
        let id = self.next_id;
        self.next_id += 1;
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| McpError::NotConnected(self.config.server_name.clone()))?;

        let outcome = match tokio::time::timeout(timeout, channel.request(id, method, params)).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout(format!("{} after {:?}", method, timeout))),
        };

        if let Err(e) = &outcome {
            self.last_error = Some(e.to_string());
            if e.is_connection_failure() {
                if let Some(mut ch) = self.channel.take() {
                    ch.close().await;
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl<C: RpcChannel> McpTransport for RpcTransport<C> {
    async fn connect(&mut self, timeout: Duration) -> bool {
        self.disconnect().await;
        match tokio::time::timeout(timeout, Self::open_and_handshake(&self.config)).await {
            Ok(Ok((channel, info))) => {
                tracing::info!(
                    server = %self.config.server_name,
                    transport = self.config.transport.label(),
                    remote = %info.name,
                    "MCP server connected"
                );
                self.channel = Some(channel);
                self.server_info = Some(info);
                self.last_error = None;
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.config.server_name, "MCP connect failed: {}", e);
                self.last_error = Some(e.to_string());
                false
            }
            Err(_) => {
                let msg = format!("connect timed out after {:?}", timeout);
                tracing::warn!(server = %self.config.server_name, "MCP {}", msg);
                self.last_error = Some(msg);
                false
            }
        }
    }

    async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>, McpError> {
        let timeout = self.config.call_timeout();
        let result = self.request(protocol::METHOD_TOOLS_LIST, json!({}), timeout).await?;
        protocol::parse_tools(result)
    }

    async fn call_tool(&mut self, name: &str, args: Value, timeout: Duration) -> Result<Value, McpError> {
        let result = self
            .request(protocol::METHOD_TOOLS_CALL, protocol::call_params(name, args), timeout)
            .await?;
        protocol::check_tool_result(result)
    }

    async fn disconnect(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close().await;
            tracing::debug!(server = %self.config.server_name, "MCP channel closed");
        }
    }

    fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.clone()
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_command_fails_connect() {
        let config = ServerConnectionConfig::new(
            "t1",
            "ghost",
            TransportKind::Stdio {
                command: "/nonexistent/hive-mcp-server".into(),
                args: vec![],
            },
        );
        let mut transport = DefaultTransportFactory.create(&config);
        assert!(!transport.connect(Duration::from_secs(2)).await);
        assert!(!transport.is_connected());
        assert!(transport.last_error().is_some());
        assert!(matches!(
            transport.list_tools().await,
            Err(McpError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_http_fails_connect() {
        let config = ServerConnectionConfig::new(
            "t1",
            "remote",
            TransportKind::Http {
                url: "http://127.0.0.1:9/mcp".into(),
                headers: Default::default(),
            },
        );
        let mut transport = DefaultTransportFactory.create(&config);
        assert!(!transport.connect(Duration::from_secs(2)).await);
    }
}
