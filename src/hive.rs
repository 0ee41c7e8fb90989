//! Hive：组装存储、Actor 运行时、注册表、执行协调器、MCP 目录与 HITL 消费者
//!
//! 所有进程级状态都由这里构造并通过依赖注入传递；运行时不可用时，
//! 会话退化为未注册的本地会话，HITL 消费退化为本地降级消费者。
//! 运行时恢复后，本地会话先被停止再交给注册表，同一身份任一时刻只有一个存活的会话。

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;

use crate::actor::{ActorRef, ActorRegistry, ActorRuntime};
use crate::agent::AgentFactory;
use crate::config::HiveConfig;
use crate::core::HiveError;
use crate::domain::{ActorIdentity, AgentExecutionConfig, ChatRequest, HitlResponseMessage};
use crate::execution::{ConversationStatus, CoordinatorSettings, ExecutionCoordinator};
use crate::hitl::HitlStateStore;
use crate::mcp::{ConnectionManager, McpDirectory, McpSettings, ServerConnectionConfig, TransportFactory, TransportKind};
use crate::router::{
    ensure_router, response_channel_key, LocalFallbackConsumer, LocalResumeDispatcher, RegistryDispatcher,
    RouterDeps, RouterHandle, RouterStatus,
};
use crate::session::{DispatchOutcome, SessionActor, SessionDeps, SessionHandle};
use crate::storage::{SnapshotStore, StateCache, StreamId, StreamStore};

/// 外部协作方
pub struct HiveParts {
    pub streams: Arc<dyn StreamStore>,
    pub cache: Arc<dyn StateCache>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub runtime: Arc<dyn ActorRuntime>,
    pub agents: Arc<dyn AgentFactory>,
    pub transports: Arc<dyn TransportFactory>,
}

/// 当前的 HITL 响应消费方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerMode {
    Router,
    Fallback,
}

pub struct Hive {
    config: HiveConfig,
    streams: Arc<dyn StreamStore>,
    registry: Arc<ActorRegistry>,
    coordinator: Arc<ExecutionCoordinator>,
    session_deps: SessionDeps,
    mcp: McpDirectory,
    fallback: LocalFallbackConsumer,
    router: AsyncMutex<Option<RouterHandle>>,
    local_sessions: AsyncMutex<HashMap<String, SessionHandle>>,
    /// 本进程创建过会话的 (tenant_id, project_id)
    projects: Mutex<BTreeSet<(String, String)>>,
    mode: Mutex<Option<ConsumerMode>>,
}

impl Hive {
    pub fn new(config: HiveConfig, parts: HiveParts) -> Self {
        let hitl = Arc::new(HitlStateStore::new(
            parts.cache.clone(),
            parts.snapshots,
            config.hitl.store_settings(),
        ));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            parts.streams.clone(),
            parts.cache,
            hitl,
            CoordinatorSettings {
                running_marker_ttl: std::time::Duration::from_secs(config.hitl.running_marker_ttl_secs),
            },
        ));

        let mailbox = config.actors.mailbox();
        let session_deps = SessionDeps {
            coordinator: coordinator.clone(),
            agents: parts.agents.clone(),
            mailbox: mailbox.clone(),
            shutdown_grace: std::time::Duration::from_secs(config.actors.shutdown_grace_secs),
        };
        let registry = Arc::new(
            ActorRegistry::new(parts.runtime, &config.app.namespace, config.actors.cooldown())
                .with_session_deps(session_deps.clone()),
        );
        let mcp = McpDirectory::new(
            registry.clone(),
            McpSettings {
                factory: parts.transports,
                mailbox,
                probe_timeout: std::time::Duration::from_secs(config.mcp.probe_timeout_secs),
            },
        );
        let fallback = LocalFallbackConsumer::new(
            parts.streams.clone(),
            config.hitl.consumer_settings(),
            Arc::new(LocalResumeDispatcher::new(
                coordinator.clone(),
                parts.agents,
                config.agent.clone(),
            )),
        );

        Self {
            config,
            streams: parts.streams,
            registry,
            coordinator,
            session_deps,
            mcp,
            fallback,
            router: AsyncMutex::new(None),
            local_sessions: AsyncMutex::new(HashMap::new()),
            projects: Mutex::new(BTreeSet::new()),
            mode: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HiveConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ActorRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<ExecutionCoordinator> {
        &self.coordinator
    }

    pub fn fallback(&self) -> &LocalFallbackConsumer {
        &self.fallback
    }

    pub fn mode(&self) -> Option<ConsumerMode> {
        self.mode.lock().ok().and_then(|m| *m)
    }

    fn set_mode(&self, mode: ConsumerMode) {
        if let Ok(mut m) = self.mode.lock() {
            *m = Some(mode);
        }
    }

    fn router_deps(&self) -> RouterDeps {
        RouterDeps {
            streams: self.streams.clone(),
            dispatcher: Arc::new(RegistryDispatcher::new(self.registry.clone(), self.config.agent.clone())),
            settings: self.config.hitl.consumer_settings(),
            mailbox: self.config.actors.mailbox(),
        }
    }

    /// 启动 HITL 消费：优先路由单例，运行时不可用时启动本地降级消费者
    ///
    /// 启动后重新监听已知项目以及仍有未过期暂停状态的项目。
    pub async fn start(&self) -> Result<ConsumerMode, HiveError> {
        let mode = match ensure_router(&self.registry, self.router_deps()).await {
            Ok(router) => {
                *self.router.lock().await = Some(router);
                tracing::info!(namespace = %self.registry.namespace(), "HITL responses consumed by router actor");
                ConsumerMode::Router
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("Router unavailable, starting local fallback consumer: {}", e);
                self.fallback.start();
                ConsumerMode::Fallback
            }
            Err(e) => return Err(e),
        };
        self.set_mode(mode);
        self.restore_channels().await;
        Ok(mode)
    }

    async fn restore_channels(&self) {
        let mut projects = self.projects.lock().map(|p| p.clone()).unwrap_or_default();
        match self.coordinator.hitl_store().pending_projects().await {
            Ok(pending) => projects.extend(pending),
            Err(e) => tracing::warn!("Failed to list projects with pending HITL state: {}", e),
        }
        for (tenant_id, project_id) in &projects {
            self.listen(tenant_id, project_id).await;
        }
        if !projects.is_empty() {
            tracing::info!(projects = projects.len(), "Response channels restored");
        }
    }

    /// 记录项目；消费者已启动时立即监听其响应通道
    async fn track_project(&self, identity: &ActorIdentity) {
        let key = (identity.tenant_id.clone(), identity.project_id.clone());
        let fresh = self.projects.lock().map(|mut p| p.insert(key)).unwrap_or(false);
        if fresh && self.mode().is_some() {
            self.listen(&identity.tenant_id, &identity.project_id).await;
        }
    }

    /// 获取（或创建并初始化）会话；运行时不可用时使用未注册的本地会话
    pub async fn session(
        &self,
        identity: &ActorIdentity,
        config: &AgentExecutionConfig,
    ) -> Result<SessionHandle, HiveError> {
        let handle = match self.registered_session(identity, config).await? {
            Some(handle) => handle,
            None => self.local_session(identity, config).await?,
        };
        self.track_project(identity).await;
        Ok(handle)
    }

    /// 注册表中的会话；运行时不可用（或仍在冷却期且已有本地会话）时返回 None
    async fn registered_session(
        &self,
        identity: &ActorIdentity,
        config: &AgentExecutionConfig,
    ) -> Result<Option<SessionHandle>, HiveError> {
        let name = identity.actor_name();
        let local = self.local_sessions.lock().await.get(&name).filter(|h| h.is_alive()).cloned();
        if let Some(local) = local {
            if !self.registry.is_available() {
                return Ok(None);
            }
            if let Err(e) = self.registry.lookup(&name).await {
                tracing::debug!(actor = %identity, "Runtime still unreachable, keeping local session: {}", e);
                return Ok(None);
            }
            self.retire_local(&name, local).await;
        }

        match self.registry.get_or_create(identity, config).await {
            Ok(handle) => Ok(Some(handle)),
            Err(HiveError::SubstrateUnavailable(reason)) => {
                tracing::warn!(actor = %identity, "Using local session: {}", reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// 停止本地会话；暂停中的对话已持久化，可由注册会话恢复
    async fn retire_local(&self, name: &str, local: SessionHandle) {
        self.local_sessions.lock().await.remove(name);
        if let Err(e) = local.shutdown().await {
            tracing::debug!(actor = %name, "Local session already stopped: {}", e);
        }
        local.kill();
        tracing::info!(actor = %name, "Runtime recovered, local session handed over to registry");
    }

    async fn local_session(
        &self,
        identity: &ActorIdentity,
        config: &AgentExecutionConfig,
    ) -> Result<SessionHandle, HiveError> {
        let mut local = self.local_sessions.lock().await;
        let name = identity.actor_name();
        let existing = local.get(&name).filter(|h| h.is_alive()).cloned();
        let handle = match existing {
            Some(existing) => existing,
            None => {
                let handle = SessionActor::spawn(identity.clone(), self.session_deps.clone());
                local.insert(name, handle.clone());
                handle
            }
        };
        drop(local);
        handle.initialize(config.clone(), false).await?;
        Ok(handle)
    }

    /// 派发一轮对话
    pub async fn chat(
        &self,
        identity: &ActorIdentity,
        config: &AgentExecutionConfig,
        request: ChatRequest,
    ) -> Result<DispatchOutcome, HiveError> {
        self.session(identity, config).await?.chat(request).await
    }

    /// 向项目响应通道追加一条人类响应，并确保当前消费者在监听该项目
    pub async fn submit_hitl_response(&self, msg: &HitlResponseMessage) -> Result<StreamId, HiveError> {
        self.listen(&msg.tenant_id, &msg.project_id).await;
        let payload = serde_json::to_value(msg)?;
        let id = self
            .streams
            .append(&response_channel_key(&msg.tenant_id, &msg.project_id), payload)
            .await?;
        tracing::info!(
            request_id = %msg.request_id,
            tenant_id = %msg.tenant_id,
            project_id = %msg.project_id,
            "HITL response submitted"
        );
        Ok(id)
    }

    /// 注册项目通道；路由失效时切换到本地降级消费者
    pub async fn listen(&self, tenant_id: &str, project_id: &str) {
        let router = self.router.lock().await.clone();
        if let Some(router) = router {
            match router.add_project(tenant_id, project_id).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(tenant_id, project_id, "Router unreachable, switching to local fallback: {}", e);
                    *self.router.lock().await = None;
                }
            }
        }
        self.fallback.add_project(tenant_id, project_id).await;
        if self.fallback.start() {
            self.set_mode(ConsumerMode::Fallback);
        }
    }

    pub async fn consumer_status(&self) -> Result<RouterStatus, HiveError> {
        let router = self.router.lock().await.clone();
        match router {
            Some(router) => router.status().await,
            None => Ok(self.fallback.status().await),
        }
    }

    pub async fn conversation_status(&self, conversation_id: &str) -> Result<ConversationStatus, HiveError> {
        self.coordinator.conversation_status(conversation_id).await
    }

    /// 租户的 MCP 连接管理器
    pub fn mcp(&self, tenant_id: &str) -> Arc<ConnectionManager> {
        self.mcp.for_tenant(tenant_id)
    }

    /// 按 [mcp] 段默认值构造服务器配置
    pub fn server_config(&self, tenant_id: &str, server_name: &str, transport: TransportKind) -> ServerConnectionConfig {
        let mut config = ServerConnectionConfig::new(tenant_id, server_name, transport)
            .with_max_reconnect_attempts(self.config.mcp.max_reconnect_attempts);
        config.timeout_secs = self.config.mcp.call_timeout_secs;
        config.connect_timeout_secs = self.config.mcp.connect_timeout_secs;
        config
    }

    /// 删除过期的快照行
    pub async fn purge_expired(&self) -> Result<u64, HiveError> {
        self.coordinator.hitl_store().purge_expired().await
    }

    /// 停止消费者、关闭会话、断开 MCP 服务器（快照存储由调用方关闭）
    pub async fn shutdown(&self) {
        let router = self.router.lock().await.take();
        if let Some(router) = router {
            if let Err(e) = router.stop().await {
                tracing::warn!("Router stop failed: {}", e);
            }
            let _ = self.registry.kill(crate::router::ROUTER_NAME).await;
        }
        self.fallback.stop().await;

        let local: Vec<SessionHandle> = self.local_sessions.lock().await.drain().map(|(_, h)| h).collect();
        for session in local {
            if let Err(e) = session.shutdown().await {
                tracing::debug!(actor = %session.identity(), "Local session already stopped: {}", e);
            }
        }

        if let Ok(names) = self.registry.list().await {
            for name in names.iter().filter(|n| n.starts_with("agent:")) {
                if let Ok(Some(ActorRef::Session(session))) = self.registry.lookup(name).await {
                    if let Err(e) = session.shutdown().await {
                        tracing::debug!(actor = %name, "Session already stopped: {}", e);
                    }
                }
                let _ = self.registry.kill(name).await;
            }
        }

        self.mcp.shutdown_all().await;
        tracing::info!("Hive shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::actor::LocalActorRuntime;
    use crate::agent::EchoAgentFactory;
    use crate::mcp::MockTransportFactory;
    use crate::storage::{MemoryStateCache, MemoryStreamStore, SqliteSnapshotStore};

    async fn hive(runtime: Arc<LocalActorRuntime>) -> Hive {
        hive_with_config(HiveConfig::default(), runtime).await
    }

    async fn hive_with_config(config: HiveConfig, runtime: Arc<LocalActorRuntime>) -> Hive {
        Hive::new(
            config,
            HiveParts {
                streams: Arc::new(MemoryStreamStore::new()),
                cache: Arc::new(MemoryStateCache::new()),
                snapshots: Arc::new(SqliteSnapshotStore::in_memory().await.unwrap()),
                runtime,
                agents: Arc::new(EchoAgentFactory::new()),
                transports: Arc::new(MockTransportFactory::new()),
            },
        )
    }

    #[tokio::test]
    async fn test_start_prefers_router() {
        let hive = hive(Arc::new(LocalActorRuntime::new())).await;
        assert_eq!(hive.start().await.unwrap(), ConsumerMode::Router);
        hive.listen("t1", "p1").await;
        let status = hive.consumer_status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.channels.len(), 1);
        hive.shutdown().await;
    }

    #[tokio::test]
    async fn test_unavailable_runtime_degrades_to_local() {
        let runtime = Arc::new(LocalActorRuntime::new());
        runtime.set_reachable(false);
        let hive = hive(runtime).await;
        assert_eq!(hive.start().await.unwrap(), ConsumerMode::Fallback);
        assert!(hive.fallback().is_running());

        let identity = ActorIdentity::with_default_mode("t1", "p1");
        let session = hive.session(&identity, &AgentExecutionConfig::default()).await.unwrap();
        let mut results = session.subscribe_results();
        hive.chat(&identity, &AgentExecutionConfig::default(), ChatRequest::new("c1", "u1", "hi"))
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), results.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.content, "Echo: hi");
        hive.shutdown().await;
    }
    #[tokio::test]
    async fn test_recovered_runtime_retires_local_session() {
        let runtime = Arc::new(LocalActorRuntime::new());
        let mut config = HiveConfig::default();
        config.actors.unavailable_cooldown_secs = 0;
        let hive = hive_with_config(config, runtime.clone()).await;
        let identity = ActorIdentity::with_default_mode("t1", "p1");
        let agent_config = AgentExecutionConfig::default();

        runtime.set_reachable(false);
        let local = hive.session(&identity, &agent_config).await.unwrap();
        assert!(local.is_alive());
        let again = hive.session(&identity, &agent_config).await.unwrap();
        assert!(again.is_alive());

        runtime.set_reachable(true);
        let registered = hive.session(&identity, &agent_config).await.unwrap();
        assert!(!local.is_alive());
        assert!(registered.is_alive());
        assert!(registered.status().await.unwrap().is_initialized);
        assert_eq!(hive.registry().list().await.unwrap(), vec![identity.actor_name()]);
        assert!(hive.local_sessions.lock().await.is_empty());
        hive.shutdown().await;
    }

    #[tokio::test]
    async fn test_sessions_register_response_channels() {
        let hive = hive(Arc::new(LocalActorRuntime::new())).await;
        let agent_config = AgentExecutionConfig::default();

        // 启动前创建的会话在 start 时补注册
        hive.session(&ActorIdentity::with_default_mode("t1", "p1"), &agent_config)
            .await
            .unwrap();
        assert!(hive.mode().is_none());
        assert_eq!(hive.start().await.unwrap(), ConsumerMode::Router);
        assert_eq!(hive.consumer_status().await.unwrap().channels.len(), 1);

        hive.session(&ActorIdentity::with_default_mode("t1", "p2"), &agent_config)
            .await
            .unwrap();
        let channels = hive.consumer_status().await.unwrap().channels;
        assert!(channels.contains(&response_channel_key("t1", "p2")));
        assert_eq!(channels.len(), 2);
        hive.shutdown().await;
    }
}
