//! 单个工具服务器的连接配置与状态

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::protocol::ServerInfo;

/// 传输方式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportKind {
    /// 本地子进程，stdin/stdout 行分隔 JSON-RPC
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// 远程 HTTP（JSON 或事件流响应）
    Http {
        url: String,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    /// 远程消息套接字
    WebSocket { url: String },
}

impl TransportKind {
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Stdio { .. } => "stdio",
            TransportKind::Http { .. } => "http",
            TransportKind::WebSocket { .. } => "websocket",
        }
    }
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_max_reconnect_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConnectionConfig {
    pub server_name: String,
    pub tenant_id: String,
    pub transport: TransportKind,
    /// 单次调用超时（秒）
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// 连续重连失败预算
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// 子进程额外环境变量
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServerConnectionConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        server_name: impl Into<String>,
        transport: TransportKind,
    ) -> Self {
        Self {
            server_name: server_name.into(),
            tenant_id: tenant_id.into(),
            transport,
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// 服务器 Actor 名称
    pub fn actor_name(&self) -> String {
        server_actor_name(&self.tenant_id, &self.server_name)
    }
}

pub fn server_actor_name(tenant_id: &str, server_name: &str) -> String {
    format!("mcp:{}:{}", tenant_id, server_name)
}

/// 连接状态快照
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerConnectionStatus {
    pub server_name: String,
    pub transport: String,
    pub connected: bool,
    pub tool_count: usize,
    pub server_info: Option<ServerInfo>,
    pub error: Option<String>,
    pub reconnect_attempts: u32,
    /// 重连预算已耗尽（调用直接失败，直到 reset）
    pub budget_exhausted: bool,
}

/// 健康检查结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub server_name: String,
    pub healthy: bool,
    /// 探测失败后是否经一次重连恢复
    pub recovered: bool,
    pub error: Option<String>,
}
