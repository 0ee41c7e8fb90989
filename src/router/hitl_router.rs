//! HITL 路由 Actor（每个进程组一个，经注册表单例路径启动）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ChannelSet, ConsumerLoop, ConsumerSettings, ConsumerStats, ConsumerStatsSnapshot, ResponseDispatcher};
use crate::actor::{Actor, ActorContext, ActorRef, ActorRegistry, Mailbox, MailboxConfig, Spawner};
use crate::core::HiveError;
use crate::domain::{AgentExecutionConfig, HitlResponseMessage};
use crate::execution::ResumeRequest;
use crate::storage::StreamStore;

pub const ROUTER_NAME: &str = "hitl-router";

/// 经注册表定位（或以默认配置创建）会话 Actor 并派发恢复
pub struct RegistryDispatcher {
    registry: Arc<ActorRegistry>,
    default_config: AgentExecutionConfig,
}

impl RegistryDispatcher {
    pub fn new(registry: Arc<ActorRegistry>, default_config: AgentExecutionConfig) -> Self {
        Self {
            registry,
            default_config,
        }
    }
}

#[async_trait]
impl ResponseDispatcher for RegistryDispatcher {
    async fn dispatch(&self, msg: HitlResponseMessage) -> Result<(), HiveError> {
        let identity = msg.identity();
        let session = self.registry.get_or_create(&identity, &self.default_config).await?;
        let mut request = ResumeRequest::new(msg.request_id, msg.response_data);
        if !msg.conversation_id.is_empty() {
            request = request.in_conversation(msg.conversation_id);
        }
        let outcome = session.continue_chat_in(request).await?;
        tracing::debug!(actor = %identity, key = outcome.key(), "Resume handed to session actor");
        Ok(())
    }
}

#[derive(Clone)]
pub struct RouterDeps {
    pub streams: Arc<dyn StreamStore>,
    pub dispatcher: Arc<dyn ResponseDispatcher>,
    pub settings: ConsumerSettings,
    pub mailbox: MailboxConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub running: bool,
    pub channels: Vec<String>,
    pub stats: ConsumerStatsSnapshot,
}

pub enum RouterCommand {
    Start {
        reply: oneshot::Sender<bool>,
    },
    AddProject {
        tenant_id: String,
        project_id: String,
        reply: oneshot::Sender<bool>,
    },
    RemoveProject {
        tenant_id: String,
        project_id: String,
        reply: oneshot::Sender<bool>,
    },
    Status {
        reply: oneshot::Sender<RouterStatus>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

pub struct HitlRouter {
    consumer: ConsumerLoop,
    running: Option<(CancellationToken, JoinHandle<()>)>,
}

impl HitlRouter {
    pub fn spawn(deps: RouterDeps) -> RouterHandle {
        let router = HitlRouter {
            consumer: ConsumerLoop {
                streams: deps.streams,
                channels: ChannelSet::new(),
                settings: deps.settings,
                dispatcher: deps.dispatcher,
                stats: Arc::new(ConsumerStats::default()),
            },
            running: None,
        };
        RouterHandle {
            mailbox: Mailbox::spawn(ROUTER_NAME, router, &deps.mailbox),
        }
    }

    fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|(_, handle)| !handle.is_finished())
            .unwrap_or(false)
    }

    fn start(&mut self) -> bool {
        if self.is_running() {
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.consumer.clone().run(cancel.clone()));
        self.running = Some((cancel, handle));
        true
    }

    async fn stop_loop(&mut self) {
        if let Some((cancel, handle)) = self.running.take() {
            cancel.cancel();
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                tracing::warn!("HITL router loop did not stop in time");
            }
        }
    }
}

#[async_trait]
impl Actor for HitlRouter {
    type Message = RouterCommand;

    async fn handle(&mut self, msg: RouterCommand, ctx: &ActorContext<RouterCommand>) {
        match msg {
            RouterCommand::Start { reply } => {
                let started = self.start();
                if started {
                    tracing::info!("HITL router started");
                }
                let _ = reply.send(started);
            }
            RouterCommand::AddProject {
                tenant_id,
                project_id,
                reply,
            } => {
                let added = self.consumer.channels.add(&tenant_id, &project_id).await;
                if added {
                    tracing::info!(tenant_id = %tenant_id, project_id = %project_id, "Router listening on project");
                }
                let _ = reply.send(added);
            }
            RouterCommand::RemoveProject {
                tenant_id,
                project_id,
                reply,
            } => {
                let _ = reply.send(self.consumer.channels.remove(&tenant_id, &project_id).await);
            }
            RouterCommand::Status { reply } => {
                let _ = reply.send(RouterStatus {
                    running: self.is_running(),
                    channels: self.consumer.channels.keys().await,
                    stats: self.consumer.stats.snapshot(),
                });
            }
            RouterCommand::Stop { reply } => {
                self.stop_loop().await;
                let _ = reply.send(());
                ctx.stop();
            }
        }
    }

    async fn on_stop(&mut self) {
        if let Some((cancel, _)) = self.running.take() {
            cancel.cancel();
        }
        tracing::info!("HITL router stopped");
    }
}

/// 路由 Actor 句柄
#[derive(Clone)]
pub struct RouterHandle {
    mailbox: Mailbox<RouterCommand>,
}

impl RouterHandle {
    pub fn is_alive(&self) -> bool {
        self.mailbox.is_alive()
    }

    pub fn kill(&self) {
        self.mailbox.kill();
    }

    /// 启动消费循环；已在运行时返回 false
    pub async fn start(&self) -> Result<bool, HiveError> {
        self.mailbox.ask(|reply| RouterCommand::Start { reply }).await
    }

    /// 可并发调用；返回是否新增
    pub async fn add_project(&self, tenant_id: &str, project_id: &str) -> Result<bool, HiveError> {
        let (tenant_id, project_id) = (tenant_id.to_string(), project_id.to_string());
        self.mailbox
            .ask(|reply| RouterCommand::AddProject {
                tenant_id,
                project_id,
                reply,
            })
            .await
    }

    pub async fn remove_project(&self, tenant_id: &str, project_id: &str) -> Result<bool, HiveError> {
        let (tenant_id, project_id) = (tenant_id.to_string(), project_id.to_string());
        self.mailbox
            .ask(|reply| RouterCommand::RemoveProject {
                tenant_id,
                project_id,
                reply,
            })
            .await
    }

    pub async fn status(&self) -> Result<RouterStatus, HiveError> {
        self.mailbox.ask(|reply| RouterCommand::Status { reply }).await
    }

    pub async fn stop(&self) -> Result<(), HiveError> {
        self.mailbox.ask(|reply| RouterCommand::Stop { reply }).await
    }
}

/// 经单例路径创建或定位路由 Actor，并确保消费循环已启动
pub async fn ensure_router(registry: &ActorRegistry, deps: RouterDeps) -> Result<RouterHandle, HiveError> {
    let spawner: Spawner = Box::new(move || ActorRef::Router(HitlRouter::spawn(deps)));
    let (actor, created) = registry.ensure_singleton(ROUTER_NAME, spawner).await?;
    let kind = actor.kind();
    let ActorRef::Router(router) = actor else {
        return Err(HiveError::InvalidPayload(format!(
            "{} is registered as a {} actor",
            ROUTER_NAME, kind
        )));
    };
    let started = router.start().await?;
    tracing::info!(created, started, "HITL router ensured");
    Ok(router)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::LocalActorRuntime;
    use crate::storage::MemoryStreamStore;

    struct NoopDispatcher;

    #[async_trait]
    impl ResponseDispatcher for NoopDispatcher {
        async fn dispatch(&self, _msg: HitlResponseMessage) -> Result<(), HiveError> {
            Ok(())
        }
    }

    fn deps() -> RouterDeps {
        RouterDeps {
            streams: Arc::new(MemoryStreamStore::new()),
            dispatcher: Arc::new(NoopDispatcher),
            settings: ConsumerSettings {
                block: Duration::from_millis(20),
                ..Default::default()
            },
            mailbox: MailboxConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_router_singleton_and_idempotent_start() {
        let registry = ActorRegistry::new(Arc::new(LocalActorRuntime::new()), "hive", Duration::from_secs(1));
        let first = ensure_router(&registry, deps()).await.unwrap();
        let second = ensure_router(&registry, deps()).await.unwrap();

        assert!(!second.start().await.unwrap());
        first.add_project("t1", "p1").await.unwrap();
        let status = second.status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.channels, vec!["hitl:responses:t1:p1".to_string()]);
        assert_eq!(registry.list().await.unwrap(), vec![ROUTER_NAME.to_string()]);

        first.stop().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_alive());
    }
}
