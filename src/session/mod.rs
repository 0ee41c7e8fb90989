//! 会话 Actor：每个 (tenant, project, mode) 身份一个
//!
//! 持有一个智能体实例，串行化 initialize / 刷新，把 chat 与 continue_chat 作为可追踪的
//! 后台单元派发，支持按会话取消。副作用全部交给执行协调器。
//!
//! 状态机：`Uninitialized → Initializing → Ready ⇄ Executing → Stopping → Terminated`，
//! `Error` 可由 Initializing / Executing 到达，重新 initialize 后恢复。

mod actor;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};

pub use actor::SessionActor;

use crate::actor::{Mailbox, MailboxConfig};
use crate::agent::{Agent, AgentFactory};
use crate::core::HiveError;
use crate::domain::{ActorIdentity, AgentExecutionConfig, ChatRequest, ChatResult};
use crate::execution::{ExecutionCoordinator, ResumeRequest};

/// 创建会话 Actor 所需的共享依赖
#[derive(Clone)]
pub struct SessionDeps {
    pub coordinator: Arc<ExecutionCoordinator>,
    pub agents: Arc<dyn AgentFactory>,
    pub mailbox: MailboxConfig,
    /// shutdown 时等待后台单元结束的上限
    pub shutdown_grace: Duration,
}

impl SessionDeps {
    pub fn new(coordinator: Arc<ExecutionCoordinator>, agents: Arc<dyn AgentFactory>) -> Self {
        Self {
            coordinator,
            agents,
            mailbox: MailboxConfig::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }

    pub fn with_mailbox(mut self, mailbox: MailboxConfig) -> Self {
        self.mailbox = mailbox;
        self
    }
}

/// 会话生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    Executing,
    Stopping,
    Terminated,
    Error,
}

/// initialize 的返回
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitializeOutcome {
    pub status: SessionState,
    /// 已初始化且未强制刷新，直接返回缓存状态
    pub cached: bool,
    pub tool_count: usize,
}

/// chat / continue_chat 的派发结果（立即返回，不等待整轮结束）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Started { key: String },
    /// 同一 key 的后台单元仍在运行，本次投递为无操作
    AlreadyRunning { key: String },
}

impl DispatchOutcome {
    pub fn key(&self) -> &str {
        match self {
            DispatchOutcome::Started { key } | DispatchOutcome::AlreadyRunning { key } => key,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub identity: ActorIdentity,
    pub state: SessionState,
    pub is_initialized: bool,
    pub is_active: bool,
    pub active_tasks: usize,
    pub total_chats: u64,
    pub total_resumes: u64,
    pub failed_turns: u64,
    pub last_error: Option<String>,
    pub initialized_at: Option<DateTime<Utc>>,
    pub tool_count: usize,
}

/// 后台单元的结束方式
pub(crate) enum TaskOutcome {
    Completed(ChatResult),
    Panicked,
}

pub enum SessionCommand {
    Initialize {
        config: AgentExecutionConfig,
        force_refresh: bool,
        reply: oneshot::Sender<Result<InitializeOutcome, HiveError>>,
    },
    InitFinished {
        generation: u64,
        result: Result<Arc<dyn Agent>, HiveError>,
    },
    Chat {
        request: ChatRequest,
        reply: oneshot::Sender<Result<DispatchOutcome, HiveError>>,
    },
    ContinueChat {
        request: ResumeRequest,
        reply: oneshot::Sender<Result<DispatchOutcome, HiveError>>,
    },
    Cancel {
        conversation_id: String,
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<SessionStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    TaskFinished {
        key: String,
        conversation_id: String,
        outcome: TaskOutcome,
    },
}

/// 会话 Actor 句柄
#[derive(Clone)]
pub struct SessionHandle {
    identity: ActorIdentity,
    mailbox: Mailbox<SessionCommand>,
    results: broadcast::Sender<ChatResult>,
}

impl SessionHandle {
    pub fn identity(&self) -> &ActorIdentity {
        &self.identity
    }

    pub fn is_alive(&self) -> bool {
        self.mailbox.is_alive()
    }

    pub fn kill(&self) {
        self.mailbox.kill();
    }

    /// 初始化（并发调用合并为一次）；已初始化且不强制刷新时返回缓存状态
    pub async fn initialize(
        &self,
        config: AgentExecutionConfig,
        force_refresh: bool,
    ) -> Result<InitializeOutcome, HiveError> {
        self.mailbox
            .ask(|reply| SessionCommand::Initialize {
                config,
                force_refresh,
                reply,
            })
            .await?
    }

    /// 派发新一轮对话，立即返回
    pub async fn chat(&self, request: ChatRequest) -> Result<DispatchOutcome, HiveError> {
        self.mailbox
            .ask(|reply| SessionCommand::Chat { request, reply })
            .await?
    }

    /// 派发 HITL 恢复，立即返回
    pub async fn continue_chat(&self, request_id: &str, response_data: Value) -> Result<DispatchOutcome, HiveError> {
        self.continue_chat_in(ResumeRequest::new(request_id, response_data)).await
    }

    /// 已知会话 ID 时使用（便于取消与失败结果关联）
    pub async fn continue_chat_in(&self, request: ResumeRequest) -> Result<DispatchOutcome, HiveError> {
        self.mailbox
            .ask(|reply| SessionCommand::ContinueChat { request, reply })
            .await?
    }

    /// 取消会话的后台单元，返回取消数量
    pub async fn cancel(&self, conversation_id: &str) -> Result<usize, HiveError> {
        let conversation_id = conversation_id.to_string();
        self.mailbox
            .ask(|reply| SessionCommand::Cancel { conversation_id, reply })
            .await
    }

    pub async fn status(&self) -> Result<SessionStatus, HiveError> {
        self.mailbox.ask(|reply| SessionCommand::Status { reply }).await
    }

    /// 取消全部后台单元，停止智能体并结束 Actor
    pub async fn shutdown(&self) -> Result<(), HiveError> {
        self.mailbox
            .ask_with_timeout(|reply| SessionCommand::Shutdown { reply }, None)
            .await
    }

    /// 订阅每轮（或每次暂停）的结果
    pub fn subscribe_results(&self) -> broadcast::Receiver<ChatResult> {
        self.results.subscribe()
    }
}
