//! HTTP 传输：POST JSON-RPC，响应可为 application/json 或 text/event-stream
//!
//! 服务端返回的 `Mcp-Session-Id` 会在后续请求中带回；关闭时发送 DELETE 结束会话。

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde_json::Value;

use super::RpcChannel;
use crate::mcp::error::McpError;
use crate::mcp::protocol::{self, JsonRpcRequest, JsonRpcResponse};
use crate::mcp::types::{ServerConnectionConfig, TransportKind};

const SESSION_HEADER: &str = "Mcp-Session-Id";

pub struct HttpChannel {
    client: reqwest::Client,
    url: String,
    headers: HashMap<String, String>,
    session_id: Option<String>,
}

impl HttpChannel {
    fn post(&self, body: &JsonRpcRequest) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(session) = &self.session_id {
            req = req.header(SESSION_HEADER, session.as_str());
        }
        req
    }
}

#[async_trait]
impl RpcChannel for HttpChannel {
    async fn open(config: &ServerConnectionConfig) -> Result<Self, McpError> {
        let TransportKind::Http { url, headers } = &config.transport else {
            return Err(McpError::Connection("http channel needs an http transport".to_string()));
        };
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self {
            client,
            url: url.clone(),
            headers: headers.clone(),
            session_id: None,
        })
    }

    async fn request(&mut self, id: u64, method: &str, params: Value) -> Result<Value, McpError> {
        let resp = self
            .post(&JsonRpcRequest::request(id, method, params))
            .send()
            .await?;

        if let Some(session) = resp
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session.to_string());
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(McpError::Connection(format!("HTTP {}: {}", status, body)));
        }

        let is_event_stream = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.starts_with("text/event-stream"))
            .unwrap_or(false);

        let body = resp.text().await?;
        let parsed = if is_event_stream {
            protocol::parse_sse_response(&body, id)?
        } else {
            serde_json::from_str::<JsonRpcResponse>(&body)?
        };
        parsed.into_result()
    }

    async fn notify(&mut self, method: &str, params: Value) -> Result<(), McpError> {
        let resp = self
            .post(&JsonRpcRequest::notification(method, params))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(McpError::Protocol(format!("notification rejected: HTTP {}", resp.status())));
        }
        Ok(())
    }

    async fn close(&mut self) {
        let Some(session) = self.session_id.take() else {
            return;
        };
        let result = self
            .client
            .delete(&self.url)
            .header(SESSION_HEADER, session.as_str())
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(url = %self.url, "Failed to end MCP HTTP session: {}", e);
        }
    }
}
