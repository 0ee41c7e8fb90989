//! 对话请求与结果
//!
//! ChatResult 每轮产生一次（或每次暂停产生一次）；暂停不是错误，is_error 保持 false。

use serde::{Deserialize, Serialize};

use super::message::Message;

/// 单次调用的覆盖参数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOverrides {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// 一轮对话请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub conversation_id: String,
    pub message_id: String,
    pub user_message: String,
    pub user_id: String,
    /// 之前的对话轮次（按时间顺序）
    #[serde(default)]
    pub context: Vec<Message>,
    #[serde(default)]
    pub attachment_ids: Vec<String>,
    pub correlation_id: Option<String>,
    pub overrides: Option<ChatOverrides>,
}

impl ChatRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4()),
            user_message: user_message.into(),
            user_id: user_id.into(),
            context: Vec::new(),
            attachment_ids: Vec::new(),
            correlation_id: None,
            overrides: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_context(mut self, context: Vec<Message>) -> Self {
        self.context = context;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// 一轮（或一次暂停）的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub conversation_id: String,
    pub message_id: String,
    pub content: String,
    /// 本轮最后一个已持久化事件的序号
    pub sequence_number: u64,
    pub is_error: bool,
    pub error_message: Option<String>,
    pub execution_time_ms: u64,
    pub event_count: usize,
    pub hitl_pending: bool,
    pub hitl_request_id: Option<String>,
}

impl ChatResult {
    /// 未进入执行即失败的结果（如 HITL 状态缺失）
    pub fn failure(
        conversation_id: impl Into<String>,
        message_id: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            message_id: message_id.into(),
            content: String::new(),
            sequence_number: 0,
            is_error: true,
            error_message: Some(error_message.into()),
            execution_time_ms: 0,
            event_count: 0,
            hitl_pending: false,
            hitl_request_id: None,
        }
    }

    /// 是否为终态（非暂停）
    pub fn is_terminal(&self) -> bool {
        !self.hitl_pending
    }
}
