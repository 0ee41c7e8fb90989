//! Mock 传输（用于测试，无需真实 MCP 服务器）
//!
//! 连接结果可按序预置；工具调用默认回显参数，也可切换为连接层失败以触发重连。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::error::McpError;
use super::protocol::{McpToolDefinition, ServerInfo};
use super::transport::{McpTransport, TransportFactory};
use super::types::ServerConnectionConfig;

#[derive(Default)]
struct MockState {
    created: AtomicUsize,
    connects: AtomicUsize,
    calls: AtomicUsize,
    connect_plan: Mutex<VecDeque<bool>>,
    connect_by_default: AtomicBool,
    drop_calls: AtomicBool,
    failure: Mutex<Option<String>>,
}

/// 可克隆的工厂；所有克隆共享计数与预置
#[derive(Clone)]
pub struct MockTransportFactory {
    state: Arc<MockState>,
    tools: Vec<McpToolDefinition>,
}

impl Default for MockTransportFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportFactory {
    pub fn new() -> Self {
        let state = MockState::default();
        state.connect_by_default.store(true, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
            tools: vec![McpToolDefinition {
                name: "echo".to_string(),
                description: "Echo arguments back".to_string(),
                input_schema: json!({"type": "object"}),
            }],
        }
    }

    /// 预置接下来若干次 connect 的结果
    pub fn plan_connects(&self, plan: &[bool]) {
        if let Ok(mut p) = self.state.connect_plan.lock() {
            p.extend(plan.iter().copied());
        }
    }

    /// 预置用尽后的默认 connect 结果
    pub fn connect_by_default(&self, ok: bool) {
        self.state.connect_by_default.store(ok, Ordering::SeqCst);
    }

    /// 让工具调用以连接中断失败
    pub fn drop_calls(&self, drop: bool) {
        self.state.drop_calls.store(drop, Ordering::SeqCst);
    }

    /// 工具调用返回 ToolFailed（连接保持）；None 恢复正常
    pub fn fail_calls(&self, message: Option<&str>) {
        if let Ok(mut f) = self.state.failure.lock() {
            *f = message.map(str::to_string);
        }
    }

    /// 已创建的传输客户端数
    pub fn created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn connect_attempts(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, config: &ServerConnectionConfig) -> Box<dyn McpTransport> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        Box::new(MockTransport {
            server: config.server_name.clone(),
            state: self.state.clone(),
            tools: self.tools.clone(),
            connected: false,
            last_error: None,
        })
    }
}

pub struct MockTransport {
    server: String,
    state: Arc<MockState>,
    tools: Vec<McpToolDefinition>,
    connected: bool,
    last_error: Option<String>,
}

#[async_trait]
impl McpTransport for MockTransport {
    async fn connect(&mut self, _timeout: Duration) -> bool {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let planned = self.state.connect_plan.lock().ok().and_then(|mut p| p.pop_front());
        let ok = planned.unwrap_or_else(|| self.state.connect_by_default.load(Ordering::SeqCst));
        self.connected = ok;
        self.last_error = (!ok).then(|| "connection refused".to_string());
        ok
    }

    async fn list_tools(&mut self) -> Result<Vec<McpToolDefinition>, McpError> {
        if !self.connected {
            return Err(McpError::NotConnected(self.server.clone()));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&mut self, name: &str, args: Value, _timeout: Duration) -> Result<Value, McpError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        if !self.connected {
            return Err(McpError::NotConnected(self.server.clone()));
        }
        if self.state.drop_calls.load(Ordering::SeqCst) {
            self.connected = false;
            return Err(McpError::Connection("connection reset by peer".to_string()));
        }
        if let Some(message) = self.state.failure.lock().ok().and_then(|f| f.clone()) {
            return Err(McpError::ToolFailed(message));
        }
        Ok(json!({
            "content": [{"type": "text", "text": format!("{}: {}", name, args)}],
            "isError": false
        }))
    }

    async fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn server_info(&self) -> Option<ServerInfo> {
        self.connected.then(|| ServerInfo {
            name: format!("mock-{}", self.server),
            version: "0.0.0".to_string(),
            protocol_version: super::protocol::PROTOCOL_VERSION.to_string(),
        })
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.clone()
    }
}
