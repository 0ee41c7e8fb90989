//! 智能体接口
//!
//! 推理循环本身是外部协作方；编排层只依赖 Agent（产出事件流）与 AgentFactory（按身份与配置创建实例）。
//! 需要人类输入时，事件流以 `AgentError::HitlPending` 结束，携带恢复所需的完整上下文。

pub mod mock;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::HiveError;
use crate::domain::{ActorIdentity, AgentExecutionConfig, ChatOverrides, HitlType, Message};

pub use mock::{EchoAgent, EchoAgentFactory, ScriptStep, ScriptedAgent, ScriptedAgentFactory};

/// 单轮执行过程事件（序号由执行协调器分配）
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// 推理步数更新
    StepUpdate { step: usize, max_steps: usize },
    /// 思考内容
    Thinking { text: String },
    /// 调用工具
    ToolCall {
        tool: String,
        call_id: String,
        args: Value,
    },
    /// 工具返回
    ToolResult {
        tool: String,
        call_id: String,
        output: String,
        success: bool,
    },
    /// 回复片段
    MessageChunk { text: String },
    /// 本轮完成
    Complete { content: String },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            AgentEvent::StepUpdate { .. } => "step_update",
            AgentEvent::Thinking { .. } => "thinking",
            AgentEvent::ToolCall { .. } => "tool_call",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::MessageChunk { .. } => "message_chunk",
            AgentEvent::Complete { .. } => "complete",
        }
    }

    /// 事件体（去掉 type 标签）
    pub fn data(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_else(|_| json!({}));
        if let Some(obj) = value.as_object_mut() {
            obj.remove("type");
        }
        value
    }
}

/// 需要人类输入的结构化暂停条件
#[derive(Debug, Clone, PartialEq)]
pub struct HitlPending {
    pub request_id: String,
    pub hitl_type: HitlType,
    pub request_data: Value,
    /// 暂停时累积的消息
    pub messages: Vec<Message>,
    pub pending_tool_call_id: Option<String>,
    pub timeout_seconds: u64,
}

impl HitlPending {
    pub fn new(hitl_type: HitlType, request_data: Value, messages: Vec<Message>) -> Self {
        Self {
            request_id: format!("hitl_{}", uuid::Uuid::new_v4()),
            hitl_type,
            request_data,
            messages,
            pending_tool_call_id: None,
            timeout_seconds: 300,
        }
    }

    pub fn with_tool_call(mut self, call_id: impl Into<String>) -> Self {
        self.pending_tool_call_id = Some(call_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }
}

/// 智能体事件流中的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 暂停等待人类输入（不是失败）
    #[error("Human input required: {}", .0.request_id)]
    HitlPending(Box<HitlPending>),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Agent stopped")]
    Stopped,
}

/// 单轮输入
#[derive(Debug, Clone, PartialEq)]
pub struct TurnInput {
    pub conversation_id: String,
    pub message_id: String,
    pub user_id: String,
    pub user_message: String,
    /// 完整上下文（含本轮用户消息或合成的 tool 结果）
    pub messages: Vec<Message>,
    /// 已执行步数（恢复时延续）
    pub step_count: usize,
    pub correlation_id: Option<String>,
    pub overrides: Option<ChatOverrides>,
    /// 若为恢复执行，对应的 HITL 请求 ID
    pub resumed_request_id: Option<String>,
}

/// 事件流
pub type AgentStream = Pin<Box<dyn Stream<Item = Result<AgentEvent, AgentError>> + Send>>;

/// 智能体实例
#[async_trait]
pub trait Agent: Send + Sync {
    /// 执行一轮，返回事件流
    fn stream(&self, input: TurnInput) -> AgentStream;

    /// 已发现的工具数
    fn tool_count(&self) -> usize {
        0
    }

    /// 停止实例并释放资源
    async fn stop(&self) {}
}

/// 按身份与配置创建智能体实例
#[async_trait]
pub trait AgentFactory: Send + Sync {
    async fn create(
        &self,
        identity: &ActorIdentity,
        config: &AgentExecutionConfig,
    ) -> Result<Arc<dyn Agent>, HiveError>;
}
