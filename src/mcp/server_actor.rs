//! 单服务器连接 Actor
//!
//! 独占一个传输客户端。连接层失败时重连：每次重连都丢弃旧客户端、由工厂新建；
//! 连续重连次数达到预算后，后续调用直接失败，直到 reset。成功的工具调用把计数清零。
//!
//! 失败的工具调用按错误分类决定是否重试以及重试几次：连接类先重建客户端，
//! 超时与资源类按次数线性退避，其余类别直接返回。

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use super::classify::classify_tool_error;
use super::error::McpError;
use super::protocol::McpToolDefinition;
use super::transport::{McpTransport, TransportFactory};
use super::types::{HealthReport, ServerConnectionConfig, ServerConnectionStatus};
use crate::actor::{Actor, ActorContext, Mailbox, MailboxConfig};
use crate::core::HiveError;

/// 非连接类重试的退避基数（第 n 次重试等待 n 倍）
const RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// 单次调用的最多尝试次数（首次 + 分类允许的最大重试）
const MAX_CALL_ATTEMPTS: u32 = 4;

pub enum ServerCommand {
    Connect {
        reply: oneshot::Sender<Result<ServerConnectionStatus, McpError>>,
    },
    CallTool {
        tool: String,
        args: Value,
        timeout: Option<Duration>,
        reply: oneshot::Sender<Result<Value, McpError>>,
    },
    ListTools {
        reply: oneshot::Sender<Vec<McpToolDefinition>>,
    },
    HealthCheck {
        probe_timeout: Duration,
        reply: oneshot::Sender<HealthReport>,
    },
    Status {
        reply: oneshot::Sender<ServerConnectionStatus>,
    },
    /// 清零重连计数并重新连接
    Reset {
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

pub struct McpServerActor {
    config: ServerConnectionConfig,
    factory: Arc<dyn TransportFactory>,
    transport: Box<dyn McpTransport>,
    tools: Vec<McpToolDefinition>,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

impl McpServerActor {
    pub fn new(config: ServerConnectionConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let transport = factory.create(&config);
        Self {
            config,
            factory,
            transport,
            tools: Vec::new(),
            reconnect_attempts: 0,
            last_error: None,
        }
    }

    pub fn spawn(
        config: ServerConnectionConfig,
        factory: Arc<dyn TransportFactory>,
        mailbox: &MailboxConfig,
    ) -> McpServerHandle {
        let name = config.actor_name();
        let call_timeout = config.call_timeout();
        let config_connect_timeout = config.connect_timeout();
        let actor = Self::new(config, factory);
        McpServerHandle {
            mailbox: Mailbox::spawn(name, actor, mailbox),
            call_timeout,
            connect_timeout: config_connect_timeout,
        }
    }

    fn budget_exhausted(&self) -> bool {
        self.reconnect_attempts >= self.config.max_reconnect_attempts
    }

    fn status(&self) -> ServerConnectionStatus {
        ServerConnectionStatus {
            server_name: self.config.server_name.clone(),
            transport: self.config.transport.label().to_string(),
            connected: self.transport.is_connected(),
            tool_count: self.tools.len(),
            server_info: self.transport.server_info(),
            error: self.last_error.clone(),
            reconnect_attempts: self.reconnect_attempts,
            budget_exhausted: self.budget_exhausted(),
        }
    }

    /// 用新建的客户端连接并加载工具列表
    async fn establish(&mut self) -> Result<(), McpError> {
        self.transport.disconnect().await;
        self.transport = self.factory.create(&self.config);
        if !self.transport.connect(self.config.connect_timeout()).await {
            let reason = self
                .transport
                .last_error()
                .unwrap_or_else(|| "connect failed".to_string());
            self.last_error = Some(reason.clone());
            return Err(McpError::Connection(reason));
        }
        match self.transport.list_tools().await {
            Ok(tools) => {
                self.tools = tools;
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                self.transport.disconnect().await;
                Err(e)
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), McpError> {
        if self.budget_exhausted() {
            return Err(McpError::ReconnectBudgetExhausted {
                server: self.config.server_name.clone(),
                attempts: self.reconnect_attempts,
            });
        }
        self.reconnect_attempts += 1;
        tracing::info!(
            server = %self.config.server_name,
            tenant_id = %self.config.tenant_id,
            attempt = self.reconnect_attempts,
            budget = self.config.max_reconnect_attempts,
            "Reconnecting MCP server"
        );
        self.establish().await
    }

    async fn call_tool(&mut self, tool: &str, args: Value, timeout: Duration) -> Result<Value, McpError> {
        if self.budget_exhausted() {
            return Err(McpError::ReconnectBudgetExhausted {
                server: self.config.server_name.clone(),
                attempts: self.reconnect_attempts,
            });
        }

        let mut retries = 0;
        loop {
            if !self.transport.is_connected() {
                self.reconnect().await?;
            }
            let started = Instant::now();
            let err = match self.transport.call_tool(tool, args.clone(), timeout).await {
                Ok(value) => {
                    self.reconnect_attempts = 0;
                    return Ok(value);
                }
                Err(e) => e,
            };

            let class = classify_tool_error(&err.to_string(), Some(started.elapsed()), Some(timeout));
            if !class.retryable || retries >= class.max_retries {
                return Err(err);
            }
            retries += 1;
            tracing::warn!(
                server = %self.config.server_name,
                tool,
                category = ?class.category,
                retry = retries,
                max_retries = class.max_retries,
                "Retrying tool call: {}",
                err
            );
            if err.is_connection_failure() && !matches!(err, McpError::Timeout(_)) {
                self.reconnect().await?;
            } else {
                tokio::time::sleep(RETRY_BACKOFF * retries).await;
            }
        }
    }

    async fn health_check(&mut self, probe_timeout: Duration) -> HealthReport {
        let probe = tokio::time::timeout(probe_timeout, self.transport.list_tools()).await;
        let failure = match probe {
            Ok(Ok(tools)) if self.transport.is_connected() => {
                self.tools = tools;
                return HealthReport {
                    server_name: self.config.server_name.clone(),
                    healthy: true,
                    recovered: false,
                    error: None,
                };
            }
            Ok(Ok(_)) => "transport disconnected".to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("probe timed out after {:?}", probe_timeout),
        };

        tracing::warn!(server = %self.config.server_name, "Health probe failed: {}", failure);
        match self.reconnect().await {
            Ok(()) => HealthReport {
                server_name: self.config.server_name.clone(),
                healthy: true,
                recovered: true,
                error: Some(failure),
            },
            Err(e) => HealthReport {
                server_name: self.config.server_name.clone(),
                healthy: false,
                recovered: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[async_trait]
impl Actor for McpServerActor {
    type Message = ServerCommand;

    async fn handle(&mut self, msg: ServerCommand, _ctx: &ActorContext<ServerCommand>) {
        match msg {
            ServerCommand::Connect { reply } => {
                let result = self.establish().await.map(|_| self.status());
                let _ = reply.send(result);
            }
            ServerCommand::CallTool {
                tool,
                args,
                timeout,
                reply,
            } => {
                let timeout = timeout.unwrap_or_else(|| self.config.call_timeout());
                let started = Instant::now();
                let preview = args_preview(&args);
                let result = self.call_tool(&tool, args, timeout).await;

                let elapsed = started.elapsed();
                let class = result.as_ref().err().map(|e| {
                    self.last_error = Some(e.to_string());
                    classify_tool_error(&e.to_string(), Some(elapsed), Some(timeout))
                });
                let outcome = class
                    .as_ref()
                    .map(|c| format!("{:?}", c.category).to_lowercase())
                    .unwrap_or_else(|| "ok".to_string());
                let audit = serde_json::json!({
                    "event": "tool_audit",
                    "server": self.config.server_name,
                    "tool": tool,
                    "ok": result.is_ok(),
                    "outcome": outcome,
                    "retryable": class.as_ref().map(|c| c.retryable),
                    "max_retries": class.as_ref().map(|c| c.max_retries),
                    "duration_ms": elapsed.as_millis() as u64,
                    "args_preview": preview,
                });
                tracing::info!(audit = %audit.to_string(), "tool");
                let _ = reply.send(result);
            }
            ServerCommand::ListTools { reply } => {
                let _ = reply.send(self.tools.clone());
            }
            ServerCommand::HealthCheck { probe_timeout, reply } => {
                let report = self.health_check(probe_timeout).await;
                let _ = reply.send(report);
            }
            ServerCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            ServerCommand::Reset { reply } => {
                self.reconnect_attempts = 0;
                let ok = self.reconnect().await.is_ok();
                if ok {
                    self.reconnect_attempts = 0;
                }
                let _ = reply.send(ok);
            }
            ServerCommand::Disconnect { reply } => {
                self.transport.disconnect().await;
                let _ = reply.send(());
            }
        }
    }

    async fn on_stop(&mut self) {
        self.transport.disconnect().await;
        tracing::info!(server = %self.config.server_name, "MCP server actor stopped");
    }
}

/// 服务器 Actor 句柄
#[derive(Clone)]
pub struct McpServerHandle {
    mailbox: Mailbox<ServerCommand>,
    call_timeout: Duration,
    connect_timeout: Duration,
}

impl McpServerHandle {
    pub fn name(&self) -> &str {
        self.mailbox.name()
    }

    pub fn is_alive(&self) -> bool {
        self.mailbox.is_alive()
    }

    pub fn kill(&self) {
        self.mailbox.kill();
    }

    /// 连接等待不设邮箱超时（由连接超时约束）
    pub async fn connect(&self) -> Result<ServerConnectionStatus, HiveError> {
        let result = self
            .mailbox
            .ask_with_timeout(|reply| ServerCommand::Connect { reply }, None)
            .await?;
        Ok(result?)
    }

    pub async fn call_tool(&self, tool: &str, args: Value, timeout: Option<Duration>) -> Result<Value, HiveError> {
        // 覆盖 actor 内部的全部重试（每次尝试可能先重连）
        let wait = (timeout.unwrap_or(self.call_timeout) + self.connect_timeout) * MAX_CALL_ATTEMPTS;
        let result = self
            .mailbox
            .ask_with_timeout(
                |reply| ServerCommand::CallTool {
                    tool: tool.to_string(),
                    args,
                    timeout,
                    reply,
                },
                Some(wait),
            )
            .await?;
        Ok(result?)
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, HiveError> {
        self.mailbox.ask(|reply| ServerCommand::ListTools { reply }).await
    }

    pub async fn health_check(&self, probe_timeout: Duration) -> Result<HealthReport, HiveError> {
        self.mailbox
            .ask_with_timeout(
                |reply| ServerCommand::HealthCheck { probe_timeout, reply },
                None,
            )
            .await
    }

    pub async fn status(&self) -> Result<ServerConnectionStatus, HiveError> {
        self.mailbox.ask(|reply| ServerCommand::Status { reply }).await
    }

    pub async fn reset(&self) -> Result<bool, HiveError> {
        self.mailbox
            .ask_with_timeout(|reply| ServerCommand::Reset { reply }, None)
            .await
    }

    pub async fn disconnect(&self) -> Result<(), HiveError> {
        self.mailbox.ask(|reply| ServerCommand::Disconnect { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::{MockTransportFactory, TransportKind};
    use serde_json::json;

    async fn connected_actor(factory: &MockTransportFactory) -> McpServerActor {
        let config = ServerConnectionConfig::new(
            "t1",
            "fs",
            TransportKind::Stdio {
                command: "mock-server".into(),
                args: vec![],
            },
        )
        .with_max_reconnect_attempts(10);
        let mut actor = McpServerActor::new(config, Arc::new(factory.clone()));
        actor.establish().await.unwrap();
        actor
    }

    #[tokio::test]
    async fn test_connection_failures_retry_up_to_class_limit() {
        let factory = MockTransportFactory::new();
        let mut actor = connected_actor(&factory).await;
        factory.drop_calls(true);

        let err = actor
            .call_tool("echo", json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Connection(_)), "unexpected error: {}", err);
        // 首次调用 + 3 次重试，每次重试前重建客户端
        assert_eq!(factory.calls(), 4);
        assert_eq!(actor.reconnect_attempts, 3);

        factory.drop_calls(false);
        assert!(actor.call_tool("echo", json!({}), Duration::from_secs(1)).await.is_ok());
        assert_eq!(actor.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_parameter_errors_are_not_retried() {
        let factory = MockTransportFactory::new();
        let mut actor = connected_actor(&factory).await;
        factory.fail_calls(Some("invalid argument: path must be absolute"));

        let err = actor
            .call_tool("read", json!({"path": "tmp"}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ToolFailed(_)));
        assert_eq!(factory.calls(), 1);
        assert_eq!(actor.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_resource_errors_back_off_without_reconnecting() {
        let factory = MockTransportFactory::new();
        let mut actor = connected_actor(&factory).await;
        let created = factory.created();
        factory.fail_calls(Some("rate limit exceeded"));

        let started = Instant::now();
        assert!(actor.call_tool("search", json!({}), Duration::from_secs(1)).await.is_err());
        assert_eq!(factory.calls(), 3);
        assert_eq!(factory.created(), created);
        assert!(started.elapsed() >= RETRY_BACKOFF * 3);
    }
}
