//! WebSocket 传输：每条文本帧一条 JSON-RPC 消息

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::RpcChannel;
use crate::mcp::error::McpError;
use crate::mcp::protocol::{JsonRpcRequest, JsonRpcResponse};
use crate::mcp::types::{ServerConnectionConfig, TransportKind};

pub struct WebSocketChannel {
    url: String,
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketChannel {
    async fn send(&mut self, message: &JsonRpcRequest) -> Result<(), McpError> {
        let text = serde_json::to_string(message)?;
        self.socket.send(WsMessage::Text(text)).await?;
        Ok(())
    }
}

#[async_trait]
impl RpcChannel for WebSocketChannel {
    async fn open(config: &ServerConnectionConfig) -> Result<Self, McpError> {
        let TransportKind::WebSocket { url } = &config.transport else {
            return Err(McpError::Connection("websocket channel needs a websocket transport".to_string()));
        };
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        Ok(Self {
            url: url.clone(),
            socket,
        })
    }

    async fn request(&mut self, id: u64, method: &str, params: Value) -> Result<Value, McpError> {
        self.send(&JsonRpcRequest::request(id, method, params)).await?;

        while let Some(frame) = self.socket.next().await {
            match frame? {
                WsMessage::Text(text) => match serde_json::from_str::<JsonRpcResponse>(&text) {
                    Ok(resp) if resp.answers(id) => return resp.into_result(),
                    Ok(_) => tracing::debug!(url = %self.url, "Skipping non-matching MCP message"),
                    Err(e) => tracing::debug!(url = %self.url, "Ignoring malformed frame: {}", e),
                },
                WsMessage::Ping(data) => {
                    self.socket.send(WsMessage::Pong(data)).await?;
                }
                WsMessage::Close(_) => {
                    return Err(McpError::Connection(format!("{} closed the socket", self.url)));
                }
                _ => {}
            }
        }
        Err(McpError::Connection(format!("{} stream ended", self.url)))
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), McpError> {
        self.send(&JsonRpcRequest::notification(method, params)).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.socket.close(None).await {
            tracing::debug!(url = %self.url, "WebSocket close failed: {}", e);
        }
    }
}
