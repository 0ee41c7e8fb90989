//! 本地降级消费者：Actor 运行时不可用时代替路由 Actor
//!
//! 通道与消费组约定与路由相同。每条消息在进程内创建一个短生命周期的智能体实例，
//! 直接执行恢复流程，结束后停止该实例。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ChannelSet, ConsumerLoop, ConsumerSettings, ConsumerStats, ResponseDispatcher, RouterStatus};
use crate::agent::AgentFactory;
use crate::core::HiveError;
use crate::domain::{AgentExecutionConfig, ChatResult, HitlResponseMessage};
use crate::execution::{ExecutionCoordinator, ResumeRequest};
use crate::storage::StreamStore;

/// 每条消息新建智能体并直接恢复
pub struct LocalResumeDispatcher {
    coordinator: Arc<ExecutionCoordinator>,
    agents: Arc<dyn AgentFactory>,
    default_config: AgentExecutionConfig,
    results: broadcast::Sender<ChatResult>,
}

impl LocalResumeDispatcher {
    pub fn new(
        coordinator: Arc<ExecutionCoordinator>,
        agents: Arc<dyn AgentFactory>,
        default_config: AgentExecutionConfig,
    ) -> Self {
        let (results, _) = broadcast::channel(64);
        Self {
            coordinator,
            agents,
            default_config,
            results,
        }
    }

    pub fn subscribe_results(&self) -> broadcast::Receiver<ChatResult> {
        self.results.subscribe()
    }
}

#[async_trait]
impl ResponseDispatcher for LocalResumeDispatcher {
    async fn dispatch(&self, msg: HitlResponseMessage) -> Result<(), HiveError> {
        let identity = msg.identity();
        let agent = self.agents.create(&identity, &self.default_config).await?;
        tracing::info!(actor = %identity, request_id = %msg.request_id, "Resuming with a transient local agent");

        let mut request = ResumeRequest::new(msg.request_id, msg.response_data);
        if !msg.conversation_id.is_empty() {
            request = request.in_conversation(msg.conversation_id);
        }
        let result = self
            .coordinator
            .resume(&identity, agent.clone(), request, CancellationToken::new())
            .await;
        agent.stop().await;

        if result.is_error {
            tracing::warn!(
                actor = %identity,
                conversation_id = %result.conversation_id,
                "Local resume ended with error: {}",
                result.error_message.as_deref().unwrap_or("unknown")
            );
        }
        let _ = self.results.send(result);
        Ok(())
    }
}

pub struct LocalFallbackConsumer {
    consumer: ConsumerLoop,
    local: Arc<LocalResumeDispatcher>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl LocalFallbackConsumer {
    pub fn new(streams: Arc<dyn StreamStore>, settings: ConsumerSettings, dispatcher: Arc<LocalResumeDispatcher>) -> Self {
        Self {
            consumer: ConsumerLoop {
                streams,
                channels: ChannelSet::new(),
                settings,
                dispatcher: dispatcher.clone(),
                stats: Arc::new(ConsumerStats::default()),
            },
            local: dispatcher,
            running: Mutex::new(None),
        }
    }

    /// 启动消费循环；已在运行时返回 false
    pub fn start(&self) -> bool {
        let Ok(mut running) = self.running.lock() else {
            return false;
        };
        if matches!(running.as_ref(), Some((_, handle)) if !handle.is_finished()) {
            return false;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(self.consumer.clone().run(cancel.clone()));
        *running = Some((cancel, handle));
        tracing::info!("Local HITL fallback consumer started");
        true
    }

    pub async fn stop(&self) {
        let taken = self.running.lock().ok().and_then(|mut r| r.take());
        if let Some((cancel, handle)) = taken {
            cancel.cancel();
            if handle.await.is_err() {
                tracing::warn!("Local fallback consume loop ended abnormally");
            }
            tracing::info!("Local HITL fallback consumer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|r| matches!(r.as_ref(), Some((_, handle)) if !handle.is_finished()))
            .unwrap_or(false)
    }

    pub async fn add_project(&self, tenant_id: &str, project_id: &str) -> bool {
        self.consumer.channels.add(tenant_id, project_id).await
    }

    pub async fn remove_project(&self, tenant_id: &str, project_id: &str) -> bool {
        self.consumer.channels.remove(tenant_id, project_id).await
    }

    pub async fn status(&self) -> RouterStatus {
        RouterStatus {
            running: self.is_running(),
            channels: self.consumer.channels.keys().await,
            stats: self.consumer.stats.snapshot(),
        }
    }

    /// 每次本地恢复的结果
    pub fn subscribe_results(&self) -> broadcast::Receiver<ChatResult> {
        self.local.subscribe_results()
    }
}
