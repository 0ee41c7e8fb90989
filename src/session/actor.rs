use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{
    DispatchOutcome, InitializeOutcome, SessionCommand, SessionDeps, SessionHandle, SessionState, SessionStatus,
    TaskOutcome,
};
use crate::actor::{Actor, ActorContext, Mailbox};
use crate::agent::Agent;
use crate::core::{HiveError, TaskKind, TaskTracker};
use crate::domain::{ActorIdentity, AgentExecutionConfig, ChatRequest, ChatResult};
use crate::execution::ResumeRequest;

const RESULT_BUFFER: usize = 64;

type InitReply = oneshot::Sender<Result<InitializeOutcome, HiveError>>;

pub struct SessionActor {
    identity: ActorIdentity,
    deps: SessionDeps,
    state: SessionState,
    agent: Option<Arc<dyn Agent>>,
    config: Option<AgentExecutionConfig>,
    /// 每次发起初始化加一，丢弃过期的完成通知
    generation: u64,
    init_waiters: Vec<InitReply>,
    tasks: TaskTracker,
    results: broadcast::Sender<ChatResult>,
    total_chats: u64,
    total_resumes: u64,
    failed_turns: u64,
    last_error: Option<String>,
    initialized_at: Option<DateTime<Utc>>,
    tool_count: usize,
}

impl SessionActor {
    /// 启动会话 Actor（未初始化）
    pub fn spawn(identity: ActorIdentity, deps: SessionDeps) -> SessionHandle {
        let (results, _) = broadcast::channel(RESULT_BUFFER);
        let mailbox_config = deps.mailbox.clone();
        let actor = SessionActor {
            identity: identity.clone(),
            deps,
            state: SessionState::Uninitialized,
            agent: None,
            config: None,
            generation: 0,
            init_waiters: Vec::new(),
            tasks: TaskTracker::new(),
            results: results.clone(),
            total_chats: 0,
            total_resumes: 0,
            failed_turns: 0,
            last_error: None,
            initialized_at: None,
            tool_count: 0,
        };
        let mailbox = Mailbox::spawn(identity.actor_name(), actor, &mailbox_config);
        SessionHandle {
            identity,
            mailbox,
            results,
        }
    }

    fn is_initialized(&self) -> bool {
        self.agent.is_some() && matches!(self.state, SessionState::Ready | SessionState::Executing)
    }

    /// Ready 且有在途单元时对外呈现为 Executing
    fn effective_state(&self) -> SessionState {
        match self.state {
            SessionState::Ready if self.tasks.active_count() > 0 => SessionState::Executing,
            state => state,
        }
    }

    fn outcome(&self, cached: bool) -> InitializeOutcome {
        InitializeOutcome {
            status: self.effective_state(),
            cached,
            tool_count: self.tool_count,
        }
    }

    fn status(&self) -> SessionStatus {
        let active_tasks = self.tasks.active_count();
        SessionStatus {
            identity: self.identity.clone(),
            state: self.effective_state(),
            is_initialized: self.is_initialized(),
            is_active: active_tasks > 0,
            active_tasks,
            total_chats: self.total_chats,
            total_resumes: self.total_resumes,
            failed_turns: self.failed_turns,
            last_error: self.last_error.clone(),
            initialized_at: self.initialized_at,
            tool_count: self.tool_count,
        }
    }

    async fn initialize(
        &mut self,
        config: AgentExecutionConfig,
        force_refresh: bool,
        reply: InitReply,
        ctx: &ActorContext<SessionCommand>,
    ) {
        if self.state == SessionState::Initializing {
            self.init_waiters.push(reply);
            return;
        }
        if self.is_initialized() && !force_refresh {
            let _ = reply.send(Ok(self.outcome(true)));
            return;
        }
        if matches!(self.state, SessionState::Stopping | SessionState::Terminated) {
            let _ = reply.send(Err(HiveError::ActorStopped(self.identity.actor_name())));
            return;
        }
        let Some(myself) = ctx.myself() else {
            let _ = reply.send(Err(HiveError::ActorStopped(self.identity.actor_name())));
            return;
        };

        if let Some(old) = self.agent.take() {
            tracing::info!(actor = %self.identity, "Refreshing session, stopping current agent");
            old.stop().await;
        }

        self.state = SessionState::Initializing;
        self.generation += 1;
        self.init_waiters.push(reply);
        self.config = Some(config.clone());

        let generation = self.generation;
        let identity = self.identity.clone();
        let factory = self.deps.agents.clone();
        tracing::info!(actor = %identity, generation, force_refresh, "Initializing session");
        tokio::spawn(async move {
            let result = factory.create(&identity, &config).await;
            let _ = myself.send(SessionCommand::InitFinished { generation, result }).await;
        });
    }

    async fn init_finished(&mut self, generation: u64, result: Result<Arc<dyn Agent>, HiveError>) {
        if generation != self.generation || self.state != SessionState::Initializing {
            if let Ok(stale) = result {
                stale.stop().await;
            }
            return;
        }

        let waiters = std::mem::take(&mut self.init_waiters);
        match result {
            Ok(agent) => {
                self.tool_count = agent.tool_count();
                self.agent = Some(agent);
                self.state = SessionState::Ready;
                self.initialized_at = Some(Utc::now());
                self.last_error = None;
                tracing::info!(actor = %self.identity, tools = self.tool_count, "Session initialized");
                let outcome = self.outcome(false);
                for waiter in waiters {
                    let _ = waiter.send(Ok(outcome.clone()));
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.state = SessionState::Error;
                self.last_error = Some(message.clone());
                tracing::error!(actor = %self.identity, "Session initialization failed: {}", message);
                for waiter in waiters {
                    let _ = waiter.send(Err(HiveError::AgentInit(message.clone())));
                }
            }
        }
    }

    /// 派发前的状态校验
    fn ready_agent(&self) -> Result<Arc<dyn Agent>, HiveError> {
        match (self.state, &self.agent) {
            (SessionState::Ready | SessionState::Executing, Some(agent)) => Ok(agent.clone()),
            (SessionState::Error, _) => Err(HiveError::SessionFailed(format!(
                "{}: {}",
                self.identity,
                self.last_error.as_deref().unwrap_or("unknown error")
            ))),
            (SessionState::Stopping | SessionState::Terminated, _) => {
                Err(HiveError::ActorStopped(self.identity.actor_name()))
            }
            _ => Err(HiveError::NotInitialized(self.identity.actor_name())),
        }
    }

    fn dispatch_chat(
        &mut self,
        request: ChatRequest,
        ctx: &ActorContext<SessionCommand>,
    ) -> Result<DispatchOutcome, HiveError> {
        let agent = self.ready_agent()?;
        let myself = ctx
            .myself()
            .ok_or_else(|| HiveError::ActorStopped(self.identity.actor_name()))?;

        let key = request.message_id.clone();
        let conversation_id = request.conversation_id.clone();
        let coordinator = self.deps.coordinator.clone();
        let identity = self.identity.clone();
        let task_key = key.clone();
        let started = self.tasks.spawn(&key, TaskKind::Chat, Some(conversation_id.clone()), move |cancel| {
            let turn = async move { coordinator.run_chat(&identity, agent, request, cancel).await };
            run_tracked(turn, task_key, conversation_id, myself)
        });

        if !started {
            tracing::debug!(actor = %self.identity, message_id = %key, "Chat already running, ignoring duplicate");
            return Ok(DispatchOutcome::AlreadyRunning { key });
        }
        self.total_chats += 1;
        tracing::info!(actor = %self.identity, message_id = %key, "Chat dispatched");
        Ok(DispatchOutcome::Started { key })
    }

    fn dispatch_resume(
        &mut self,
        request: ResumeRequest,
        ctx: &ActorContext<SessionCommand>,
    ) -> Result<DispatchOutcome, HiveError> {
        let agent = self.ready_agent()?;
        let myself = ctx
            .myself()
            .ok_or_else(|| HiveError::ActorStopped(self.identity.actor_name()))?;

        let key = request.request_id.clone();
        let conversation_id = request.conversation_id.clone();
        let coordinator = self.deps.coordinator.clone();
        let identity = self.identity.clone();
        let task_key = key.clone();
        let result_conversation = conversation_id.clone().unwrap_or_default();
        let started = self.tasks.spawn(&key, TaskKind::Resume, conversation_id, move |cancel| {
            let turn = async move { coordinator.resume(&identity, agent, request, cancel).await };
            run_tracked(turn, task_key, result_conversation, myself)
        });

        if !started {
            tracing::debug!(actor = %self.identity, request_id = %key, "Resume already running, ignoring duplicate");
            return Ok(DispatchOutcome::AlreadyRunning { key });
        }
        self.total_resumes += 1;
        tracing::info!(actor = %self.identity, request_id = %key, "Resume dispatched");
        Ok(DispatchOutcome::Started { key })
    }

    fn task_finished(&mut self, key: String, conversation_id: String, outcome: TaskOutcome) {
        self.tasks.finish(&key);
        let result = match outcome {
            TaskOutcome::Completed(result) => {
                if result.is_error {
                    self.failed_turns += 1;
                    self.last_error = result.error_message.clone();
                }
                result
            }
            TaskOutcome::Panicked => {
                self.failed_turns += 1;
                let message = format!("background task {} panicked", key);
                tracing::error!(actor = %self.identity, task = %key, "Session entering error state: {}", message);
                if matches!(self.state, SessionState::Ready | SessionState::Executing) {
                    self.state = SessionState::Error;
                }
                self.last_error = Some(message.clone());
                ChatResult::failure(conversation_id, &key, message)
            }
        };
        // 没有订阅者时发送失败，属正常情况
        let _ = self.results.send(result);
    }

    async fn shutdown(&mut self) {
        self.state = SessionState::Stopping;
        tracing::info!(actor = %self.identity, active = self.tasks.active_count(), "Session shutting down");
        self.tasks.cancel_all();
        self.tasks.join_all(self.deps.shutdown_grace).await;
        if let Some(agent) = self.agent.take() {
            agent.stop().await;
        }
        for waiter in self.init_waiters.drain(..) {
            let _ = waiter.send(Err(HiveError::ActorStopped(self.identity.actor_name())));
        }
        self.state = SessionState::Terminated;
    }
}

/// 执行一轮并把结果（或 panic）回报给所属 Actor
async fn run_tracked<F>(turn: F, key: String, conversation_id: String, myself: mpsc::Sender<SessionCommand>)
where
    F: std::future::Future<Output = ChatResult> + Send,
{
    let outcome = match AssertUnwindSafe(turn).catch_unwind().await {
        Ok(result) => TaskOutcome::Completed(result),
        Err(_) => TaskOutcome::Panicked,
    };
    let _ = myself
        .send(SessionCommand::TaskFinished {
            key,
            conversation_id,
            outcome,
        })
        .await;
}

#[async_trait]
impl Actor for SessionActor {
    type Message = SessionCommand;

    async fn handle(&mut self, msg: SessionCommand, ctx: &ActorContext<SessionCommand>) {
        match msg {
            SessionCommand::Initialize {
                config,
                force_refresh,
                reply,
            } => self.initialize(config, force_refresh, reply, ctx).await,
            SessionCommand::InitFinished { generation, result } => self.init_finished(generation, result).await,
            SessionCommand::Chat { request, reply } => {
                let _ = reply.send(self.dispatch_chat(request, ctx));
            }
            SessionCommand::ContinueChat { request, reply } => {
                let _ = reply.send(self.dispatch_resume(request, ctx));
            }
            SessionCommand::Cancel { conversation_id, reply } => {
                let cancelled = self.tasks.cancel_conversation(&conversation_id);
                tracing::info!(actor = %self.identity, conversation_id = %conversation_id, cancelled, "Cancel requested");
                let _ = reply.send(cancelled);
            }
            SessionCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            SessionCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                ctx.stop();
            }
            SessionCommand::TaskFinished {
                key,
                conversation_id,
                outcome,
            } => self.task_finished(key, conversation_id, outcome),
        }
    }

    async fn on_restart(&mut self, _ctx: &ActorContext<SessionCommand>) {
        self.last_error = Some("session actor recovered from a panic".to_string());
    }

    async fn on_stop(&mut self) {
        if self.state != SessionState::Terminated {
            self.tasks.cancel_all();
            if let Some(agent) = self.agent.take() {
                agent.stop().await;
            }
            self.state = SessionState::Terminated;
        }
        tracing::info!(actor = %self.identity, "Session actor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use serde_json::json;

    use crate::agent::{EchoAgentFactory, ScriptStep, ScriptedAgent, ScriptedAgentFactory};
    use crate::domain::HitlType;
    use crate::execution::{CoordinatorSettings, ExecutionCoordinator};
    use crate::hitl::{HitlStateStore, HitlStoreSettings};
    use crate::storage::{MemoryStateCache, MemoryStreamStore, SqliteSnapshotStore};

    async fn coordinator() -> Arc<ExecutionCoordinator> {
        let cache = Arc::new(MemoryStateCache::new());
        let snapshots = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());
        let hitl = Arc::new(HitlStateStore::new(cache.clone(), snapshots, HitlStoreSettings::default()));
        Arc::new(ExecutionCoordinator::new(
            Arc::new(MemoryStreamStore::new()),
            cache,
            hitl,
            CoordinatorSettings::default(),
        ))
    }

    fn identity() -> ActorIdentity {
        ActorIdentity::with_default_mode("t1", "p1")
    }

    async fn next_result(rx: &mut broadcast::Receiver<ChatResult>) -> ChatResult {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("result in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_concurrent_initialize_collapses() {
        let factory = Arc::new(EchoAgentFactory::new());
        let handle = SessionActor::spawn(identity(), SessionDeps::new(coordinator().await, factory.clone()));

        let (a, b) = tokio::join!(
            handle.initialize(AgentExecutionConfig::default(), false),
            handle.initialize(AgentExecutionConfig::default(), false)
        );
        assert!(!a.unwrap().cached);
        assert!(!b.unwrap().cached);
        assert_eq!(factory.created(), 1);

        let cached = handle.initialize(AgentExecutionConfig::default(), false).await.unwrap();
        assert!(cached.cached);

        let refreshed = handle.initialize(AgentExecutionConfig::default(), true).await.unwrap();
        assert!(!refreshed.cached);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_chat_requires_initialize() {
        let handle = SessionActor::spawn(
            identity(),
            SessionDeps::new(coordinator().await, Arc::new(EchoAgentFactory::new())),
        );
        let err = handle.chat(ChatRequest::new("c1", "u1", "hi")).await.unwrap_err();
        assert!(matches!(err, HiveError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_chat_is_fire_and_forget() {
        let agent = Arc::new(ScriptedAgent::new(vec![vec![
            ScriptStep::Sleep(Duration::from_millis(100)),
            ScriptStep::Say("finished".into()),
        ]]));
        let factory = Arc::new(ScriptedAgentFactory::new(agent));
        let handle = SessionActor::spawn(identity(), SessionDeps::new(coordinator().await, factory));
        handle.initialize(AgentExecutionConfig::default(), false).await.unwrap();
        let mut results = handle.subscribe_results();

        let request = ChatRequest::new("c1", "u1", "work").with_message_id("m1");
        let outcome = handle.chat(request.clone()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Started { key: "m1".into() });

        // 轮次未结束时 Actor 仍能应答
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, SessionState::Executing);
        assert_eq!(
            handle.chat(request).await.unwrap(),
            DispatchOutcome::AlreadyRunning { key: "m1".into() }
        );

        let result = next_result(&mut results).await;
        assert_eq!(result.content, "finished");
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, SessionState::Ready);
        assert_eq!(status.total_chats, 1);
    }

    #[tokio::test]
    async fn test_cancel_by_conversation() {
        let agent = Arc::new(ScriptedAgent::new(vec![vec![ScriptStep::Sleep(Duration::from_secs(10))]]));
        let handle = SessionActor::spawn(
            identity(),
            SessionDeps::new(coordinator().await, Arc::new(ScriptedAgentFactory::new(agent))),
        );
        handle.initialize(AgentExecutionConfig::default(), false).await.unwrap();
        let mut results = handle.subscribe_results();

        handle.chat(ChatRequest::new("c9", "u1", "slow")).await.unwrap();
        assert_eq!(handle.cancel("c9").await.unwrap(), 1);
        let result = next_result(&mut results).await;
        assert!(result.is_error);
        assert_eq!(result.error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_pause_and_resume_through_session() {
        let agent = Arc::new(ScriptedAgent::new(vec![
            vec![ScriptStep::AskHuman {
                hitl_type: HitlType::Decision,
                request_data: json!({"options": ["deploy", "wait"]}),
                timeout_seconds: 60,
            }],
            vec![ScriptStep::Say("deploying".into())],
        ]));
        let handle = SessionActor::spawn(
            identity(),
            SessionDeps::new(coordinator().await, Arc::new(ScriptedAgentFactory::new(agent.clone()))),
        );
        handle.initialize(AgentExecutionConfig::default(), false).await.unwrap();
        let mut results = handle.subscribe_results();

        handle.chat(ChatRequest::new("c2", "u1", "ship it")).await.unwrap();
        let paused = next_result(&mut results).await;
        assert!(paused.hitl_pending);

        let request_id = paused.hitl_request_id.unwrap();
        handle.continue_chat(&request_id, json!({"decision": "deploy"})).await.unwrap();
        let resumed = next_result(&mut results).await;
        assert_eq!(resumed.content, "deploying");
        assert_eq!(agent.inputs()[1].messages.last().unwrap().content, "User chose: deploy");
        assert_eq!(handle.status().await.unwrap().total_resumes, 1);
    }

    #[tokio::test]
    async fn test_failed_initialize_enters_error_state() {
        let factory = Arc::new(ScriptedAgentFactory::new(Arc::new(ScriptedAgent::new(vec![]))));
        factory.fail_creation(Some("missing api key"));
        let handle = SessionActor::spawn(identity(), SessionDeps::new(coordinator().await, factory.clone()));

        assert!(handle.initialize(AgentExecutionConfig::default(), false).await.is_err());
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, SessionState::Error);
        assert!(matches!(
            handle.chat(ChatRequest::new("c1", "u1", "hi")).await,
            Err(HiveError::SessionFailed(_))
        ));

        factory.fail_creation(None);
        handle.initialize(AgentExecutionConfig::default(), false).await.unwrap();
        assert!(handle.status().await.unwrap().is_initialized);
    }

    #[tokio::test]
    async fn test_shutdown_stops_agent() {
        let agent = Arc::new(ScriptedAgent::new(vec![]));
        let handle = SessionActor::spawn(
            identity(),
            SessionDeps::new(coordinator().await, Arc::new(ScriptedAgentFactory::new(agent.clone()))),
        );
        handle.initialize(AgentExecutionConfig::default(), false).await.unwrap();
        handle.shutdown().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_alive());
        assert_eq!(agent.stop_count(), 1);
    }
}
