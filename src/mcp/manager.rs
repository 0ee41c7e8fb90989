//! 连接管理器：每租户一个，server_name → 服务器 Actor 句柄
//!
//! 启动服务器时创建命名、独立生命周期的 Actor；连接失败立即拆除，不留半存活的 Actor。
//! 调用时若本进程缓存的句柄失效（或从未缓存），先按派生名称到注册表自愈查找。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::RwLock;

use super::protocol::McpToolDefinition;
use super::server_actor::{McpServerActor, McpServerHandle};
use super::transport::TransportFactory;
use super::types::{server_actor_name, HealthReport, ServerConnectionConfig, ServerConnectionStatus};
use crate::actor::{ActorRef, ActorRegistry, MailboxConfig, Spawner};
use crate::core::HiveError;

/// 管理器共享参数
#[derive(Clone)]
pub struct McpSettings {
    pub factory: Arc<dyn TransportFactory>,
    pub mailbox: MailboxConfig,
    pub probe_timeout: Duration,
}

pub struct ConnectionManager {
    tenant_id: String,
    registry: Arc<ActorRegistry>,
    settings: McpSettings,
    servers: RwLock<HashMap<String, McpServerHandle>>,
}

impl ConnectionManager {
    pub fn new(tenant_id: impl Into<String>, registry: Arc<ActorRegistry>, settings: McpSettings) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            registry,
            settings,
            servers: RwLock::new(HashMap::new()),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// 启动并连接服务器；已存在时返回其状态
    pub async fn start_server(&self, config: ServerConnectionConfig) -> Result<ServerConnectionStatus, HiveError> {
        if config.tenant_id != self.tenant_id {
            return Err(HiveError::InvalidPayload(format!(
                "server {} belongs to tenant {}, not {}",
                config.server_name, config.tenant_id, self.tenant_id
            )));
        }
        let server_name = config.server_name.clone();
        if let Some(existing) = self.cached(&server_name).await {
            return existing.status().await;
        }

        let name = config.actor_name();
        let factory = self.settings.factory.clone();
        let mailbox = self.settings.mailbox.clone();
        let spawner: Spawner = Box::new(move || ActorRef::McpServer(McpServerActor::spawn(config, factory, &mailbox)));
        let (actor, created) = self.registry.ensure_singleton(&name, spawner).await?;
        let kind = actor.kind();
        let ActorRef::McpServer(handle) = actor else {
            return Err(HiveError::InvalidPayload(format!("{} is registered as a {} actor", name, kind)));
        };

        if !created {
            self.servers.write().await.insert(server_name, handle.clone());
            return handle.status().await;
        }

        match handle.connect().await {
            Ok(status) => {
                tracing::info!(
                    tenant_id = %self.tenant_id,
                    server = %server_name,
                    tools = status.tool_count,
                    "MCP server started"
                );
                self.servers.write().await.insert(server_name, handle);
                Ok(status)
            }
            Err(e) => {
                tracing::warn!(tenant_id = %self.tenant_id, server = %server_name, "MCP server failed to start: {}", e);
                handle.kill();
                if let Err(kill_err) = self.registry.kill(&name).await {
                    tracing::warn!(actor = %name, "Failed to unregister server actor: {}", kill_err);
                }
                Err(e)
            }
        }
    }

    async fn cached(&self, server_name: &str) -> Option<McpServerHandle> {
        let servers = self.servers.read().await;
        servers.get(server_name).filter(|h| h.is_alive()).cloned()
    }

    /// 本进程缓存 → 注册表自愈查找
    async fn resolve(&self, server_name: &str) -> Result<McpServerHandle, HiveError> {
        if let Some(handle) = self.cached(server_name).await {
            return Ok(handle);
        }
        self.servers.write().await.remove(server_name);

        let name = server_actor_name(&self.tenant_id, server_name);
        match self.registry.lookup(&name).await {
            Ok(Some(ActorRef::McpServer(handle))) if handle.is_alive() => {
                tracing::info!(tenant_id = %self.tenant_id, server = server_name, "Recovered server actor handle from registry");
                self.servers
                    .write()
                    .await
                    .insert(server_name.to_string(), handle.clone());
                Ok(handle)
            }
            Ok(_) => Err(HiveError::McpServerNotFound(server_name.to_string())),
            Err(e) => {
                tracing::warn!(server = server_name, "Self-heal lookup failed: {}", e);
                Err(HiveError::McpServerNotFound(server_name.to_string()))
            }
        }
    }

    pub async fn call_tool(
        &self,
        server_name: &str,
        tool: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, HiveError> {
        let handle = self.resolve(server_name).await?;
        handle.call_tool(tool, args, timeout).await
    }

    pub async fn stop_server(&self, server_name: &str) -> Result<bool, HiveError> {
        let handle = self.servers.write().await.remove(server_name);
        if let Some(handle) = &handle {
            if let Err(e) = handle.disconnect().await {
                tracing::debug!(server = server_name, "Disconnect before stop failed: {}", e);
            }
            handle.kill();
        }
        let name = server_actor_name(&self.tenant_id, server_name);
        let unregistered = self.registry.kill(&name).await.unwrap_or(false);
        Ok(handle.is_some() || unregistered)
    }

    pub async fn reset_server(&self, server_name: &str) -> Result<bool, HiveError> {
        let handle = self.resolve(server_name).await?;
        handle.reset().await
    }

    pub async fn list_servers(&self) -> Vec<ServerConnectionStatus> {
        let handles: Vec<McpServerHandle> = self.servers.read().await.values().cloned().collect();
        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.status().await {
                Ok(status) => statuses.push(status),
                Err(e) => tracing::debug!(actor = handle.name(), "Status unavailable: {}", e),
            }
        }
        statuses.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        statuses
    }

    /// 全部服务器的工具（server_name, 定义）
    pub async fn list_all_tools(&self) -> Vec<(String, McpToolDefinition)> {
        let handles: Vec<(String, McpServerHandle)> = self
            .servers
            .read()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut tools = Vec::new();
        for (server, handle) in handles {
            if let Ok(defs) = handle.list_tools().await {
                tools.extend(defs.into_iter().map(|d| (server.clone(), d)));
            }
        }
        tools
    }

    pub async fn health_check_all(&self) -> Vec<HealthReport> {
        let handles: Vec<McpServerHandle> = self.servers.read().await.values().cloned().collect();
        let mut reports = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.health_check(self.settings.probe_timeout).await {
                Ok(report) => reports.push(report),
                Err(e) => tracing::warn!(actor = handle.name(), "Health check failed: {}", e),
            }
        }
        reports
    }

    pub async fn shutdown(&self) {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        for name in names {
            let _ = self.stop_server(&name).await;
        }
    }
}

/// 租户目录：每租户一个连接管理器
pub struct McpDirectory {
    registry: Arc<ActorRegistry>,
    settings: McpSettings,
    managers: Mutex<HashMap<String, Arc<ConnectionManager>>>,
}

impl McpDirectory {
    pub fn new(registry: Arc<ActorRegistry>, settings: McpSettings) -> Self {
        Self {
            registry,
            settings,
            managers: Mutex::new(HashMap::new()),
        }
    }

    pub fn for_tenant(&self, tenant_id: &str) -> Arc<ConnectionManager> {
        let mut managers = match self.managers.lock() {
            Ok(m) => m,
            Err(poisoned) => poisoned.into_inner(),
        };
        managers
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                Arc::new(ConnectionManager::new(
                    tenant_id,
                    self.registry.clone(),
                    self.settings.clone(),
                ))
            })
            .clone()
    }

    pub async fn shutdown_all(&self) {
        let managers: Vec<Arc<ConnectionManager>> = match self.managers.lock() {
            Ok(m) => m.values().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
        };
        for manager in managers {
            manager.shutdown().await;
        }
    }
}
