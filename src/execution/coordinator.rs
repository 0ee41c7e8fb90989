//! 执行协调器：驱动单轮对话，分配并持久化序号，处理 HITL 暂停与恢复
//!
//! 暂停：发布 hitl_requested → 双写 HitlAgentState → 返回 hitl_pending（不是错误）。
//! 恢复：认领（删除）状态 → 按类型合成 tool 结果 → 从 max(状态序号, 日志尾序号) 继续编号 → 重新调用智能体。
//! 嵌套暂停沿用同一流程；已发布的事件不会撤回。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::event_log::{EventLog, Sequencer};
use crate::agent::{Agent, AgentError, AgentEvent, HitlPending, TurnInput};
use crate::core::HiveError;
use crate::domain::{
    ActorIdentity, ChatOverrides, ChatRequest, ChatResult, HitlAgentState, HitlResponse, Message,
};
use crate::hitl::{HitlStateStore, STATE_NOT_FOUND};
use crate::storage::{StateCache, StreamStore};

pub fn running_marker_key(conversation_id: &str) -> String {
    format!("agent:running:{}", conversation_id)
}

/// 恢复请求
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeRequest {
    pub request_id: String,
    pub response_data: Value,
    /// 已知时用于失败结果与取消匹配
    pub conversation_id: Option<String>,
}

impl ResumeRequest {
    pub fn new(request_id: impl Into<String>, response_data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            response_data,
            conversation_id: None,
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

/// 会话执行状态（暂停 ⇔ HITL 状态记录存在）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConversationStatus {
    Idle,
    Running { message_id: String },
    Paused { request_id: String },
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// 运行中标记的 TTL（进程崩溃后自动失效）
    pub running_marker_ttl: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            running_marker_ttl: Duration::from_secs(3600),
        }
    }
}

/// 单轮的不变上下文
struct TurnContext {
    identity: ActorIdentity,
    conversation_id: String,
    message_id: String,
    user_id: String,
    user_message: String,
    correlation_id: Option<String>,
    started: Instant,
}

impl TurnContext {
    fn result(&self, seq: &Sequencer, content: String) -> ChatResult {
        ChatResult {
            conversation_id: self.conversation_id.clone(),
            message_id: self.message_id.clone(),
            content,
            sequence_number: seq.current(),
            is_error: false,
            error_message: None,
            execution_time_ms: self.started.elapsed().as_millis() as u64,
            event_count: seq.emitted(),
            hitl_pending: false,
            hitl_request_id: None,
        }
    }
}

pub struct ExecutionCoordinator {
    log: EventLog,
    cache: Arc<dyn StateCache>,
    hitl: Arc<HitlStateStore>,
    settings: CoordinatorSettings,
}

impl ExecutionCoordinator {
    pub fn new(
        streams: Arc<dyn StreamStore>,
        cache: Arc<dyn StateCache>,
        hitl: Arc<HitlStateStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            log: EventLog::new(streams),
            cache,
            hitl,
            settings,
        }
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn hitl_store(&self) -> &Arc<HitlStateStore> {
        &self.hitl
    }

    async fn mark_running(&self, conversation_id: &str, message_id: &str) {
        if let Err(e) = self
            .cache
            .set(
                &running_marker_key(conversation_id),
                message_id.to_string(),
                self.settings.running_marker_ttl,
            )
            .await
        {
            tracing::warn!(conversation_id, "Failed to set running marker: {}", e);
        }
    }

    async fn clear_running(&self, conversation_id: &str) {
        if let Err(e) = self.cache.delete(&running_marker_key(conversation_id)).await {
            tracing::warn!(conversation_id, "Failed to clear running marker: {}", e);
        }
    }

    /// 执行新一轮对话
    pub async fn run_chat(
        &self,
        identity: &ActorIdentity,
        agent: Arc<dyn Agent>,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> ChatResult {
        let ctx = TurnContext {
            identity: identity.clone(),
            conversation_id: request.conversation_id.clone(),
            message_id: request.message_id.clone(),
            user_id: request.user_id.clone(),
            user_message: request.user_message.clone(),
            correlation_id: request.correlation_id.clone(),
            started: Instant::now(),
        };
        self.mark_running(&ctx.conversation_id, &ctx.message_id).await;

        let start_after = match self.log.last_sequence(&ctx.conversation_id).await {
            Ok(n) => n,
            Err(e) => {
                self.clear_running(&ctx.conversation_id).await;
                return ChatResult::failure(&ctx.conversation_id, &ctx.message_id, e.to_string());
            }
        };
        let mut seq = Sequencer::new(self.log.clone(), &ctx.conversation_id, &ctx.message_id, start_after);

        tracing::info!(
            actor = %ctx.identity,
            conversation_id = %ctx.conversation_id,
            message_id = %ctx.message_id,
            start_after,
            "Turn started"
        );
        let started = json!({
            "user_message": request.user_message,
            "user_id": request.user_id,
            "correlation_id": request.correlation_id,
            "attachment_ids": request.attachment_ids,
        });
        if let Err(e) = seq.emit("turn_started", started).await {
            return self.fail(&ctx, &mut seq, e.to_string(), String::new()).await;
        }

        let mut messages = request.context.clone();
        messages.push(Message::user(&request.user_message));
        let input = TurnInput {
            conversation_id: ctx.conversation_id.clone(),
            message_id: ctx.message_id.clone(),
            user_id: ctx.user_id.clone(),
            user_message: ctx.user_message.clone(),
            messages,
            step_count: 0,
            correlation_id: ctx.correlation_id.clone(),
            overrides: request.overrides.clone(),
            resumed_request_id: None,
        };
        self.drive(&ctx, agent, input, seq, cancel).await
    }

    /// 恢复暂停的一轮；状态缺失（或已被认领）时返回终态错误结果
    pub async fn resume(
        &self,
        identity: &ActorIdentity,
        agent: Arc<dyn Agent>,
        request: ResumeRequest,
        cancel: CancellationToken,
    ) -> ChatResult {
        let started = Instant::now();
        let Some(state) = self.hitl.claim(&request.request_id).await else {
            tracing::warn!(request_id = %request.request_id, "Resume rejected: {}", STATE_NOT_FOUND);
            // 状态缺失时不知道原始消息 ID
            let conversation_id = request.conversation_id.clone().unwrap_or_default();
            let mut result = ChatResult::failure(conversation_id, "", STATE_NOT_FOUND);
            result.execution_time_ms = started.elapsed().as_millis() as u64;
            return result;
        };

        let ctx = TurnContext {
            identity: identity.clone(),
            conversation_id: state.conversation_id.clone(),
            message_id: state.message_id.clone(),
            user_id: state.user_id.clone(),
            user_message: state.user_message.clone(),
            correlation_id: state.correlation_id.clone(),
            started,
        };

        let response = HitlResponse::from_response_data(state.hitl_type, &request.response_data);
        let tool_text = response.to_tool_result();
        let mut messages = state.messages.clone();
        match &state.pending_tool_call_id {
            Some(call_id) => messages.push(Message::tool(call_id, &tool_text)),
            None => messages.push(Message::user(&tool_text)),
        }

        self.mark_running(&ctx.conversation_id, &ctx.message_id).await;
        let observed = match self.log.last_sequence(&ctx.conversation_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(conversation_id = %ctx.conversation_id, "Event log unreadable, using saved sequence: {}", e);
                state.last_sequence_number
            }
        };
        let start_after = state.last_sequence_number.max(observed);
        let mut seq = Sequencer::new(self.log.clone(), &ctx.conversation_id, &ctx.message_id, start_after);

        tracing::info!(
            actor = %ctx.identity,
            conversation_id = %ctx.conversation_id,
            request_id = %request.request_id,
            hitl_type = %state.hitl_type,
            start_after,
            "Resuming paused turn"
        );
        let resolved = json!({
            "request_id": request.request_id,
            "hitl_type": state.hitl_type,
            "tool_result": tool_text,
        });
        if let Err(e) = seq.emit("hitl_resolved", resolved).await {
            return self.fail(&ctx, &mut seq, e.to_string(), String::new()).await;
        }

        let input = TurnInput {
            conversation_id: ctx.conversation_id.clone(),
            message_id: ctx.message_id.clone(),
            user_id: ctx.user_id.clone(),
            user_message: ctx.user_message.clone(),
            messages,
            step_count: state.step_count,
            correlation_id: ctx.correlation_id.clone(),
            overrides: None::<ChatOverrides>,
            resumed_request_id: Some(request.request_id.clone()),
        };
        self.drive(&ctx, agent, input, seq, cancel).await
    }

    /// 消费事件流直到完成、暂停、出错或取消
    async fn drive(
        &self,
        ctx: &TurnContext,
        agent: Arc<dyn Agent>,
        input: TurnInput,
        mut seq: Sequencer,
        cancel: CancellationToken,
    ) -> ChatResult {
        let mut step_count = input.step_count;
        let mut stream = agent.stream(input);
        let mut content = String::new();
        let mut completed = false;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.cancelled(ctx, &mut seq, content).await;
                }
                item = stream.next() => item,
            };

            match next {
                None => break,
                Some(Ok(event)) => {
                    match &event {
                        AgentEvent::StepUpdate { step, .. } => step_count = *step,
                        AgentEvent::MessageChunk { text } => content.push_str(text),
                        AgentEvent::Complete { content: final_content } => {
                            content = final_content.clone();
                            completed = true;
                        }
                        _ => {}
                    }
                    if let Err(e) = seq.emit(event.event_type(), event.data()).await {
                        return self.fail(ctx, &mut seq, e.to_string(), content).await;
                    }
                    if completed {
                        break;
                    }
                }
                Some(Err(AgentError::HitlPending(pending))) => {
                    return self.pause(ctx, &mut seq, *pending, step_count, content).await;
                }
                Some(Err(e)) => {
                    return self.fail(ctx, &mut seq, e.to_string(), content).await;
                }
            }
        }

        if !completed {
            if let Err(e) = seq.emit("complete", json!({ "content": content })).await {
                return self.fail(ctx, &mut seq, e.to_string(), content).await;
            }
        }
        self.clear_running(&ctx.conversation_id).await;
        tracing::info!(
            conversation_id = %ctx.conversation_id,
            message_id = %ctx.message_id,
            sequence_number = seq.current(),
            events = seq.emitted(),
            "Turn completed"
        );
        ctx.result(&seq, content)
    }

    async fn pause(
        &self,
        ctx: &TurnContext,
        seq: &mut Sequencer,
        pending: HitlPending,
        step_count: usize,
        content: String,
    ) -> ChatResult {
        let requested = json!({
            "request_id": pending.request_id,
            "hitl_type": pending.hitl_type,
            "request_data": pending.request_data,
            "timeout_seconds": pending.timeout_seconds,
        });
        if let Err(e) = seq.emit("hitl_requested", requested).await {
            return self.fail(ctx, seq, e.to_string(), content).await;
        }

        let state = HitlAgentState {
            conversation_id: ctx.conversation_id.clone(),
            message_id: ctx.message_id.clone(),
            tenant_id: ctx.identity.tenant_id.clone(),
            project_id: ctx.identity.project_id.clone(),
            agent_mode: ctx.identity.agent_mode.clone(),
            hitl_request_id: pending.request_id.clone(),
            hitl_type: pending.hitl_type,
            request_data: pending.request_data,
            messages: pending.messages,
            user_message: ctx.user_message.clone(),
            user_id: ctx.user_id.clone(),
            correlation_id: ctx.correlation_id.clone(),
            step_count,
            timeout_seconds: pending.timeout_seconds,
            pending_tool_call_id: pending.pending_tool_call_id,
            last_sequence_number: seq.current(),
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        if let Err(e) = self.hitl.save(&state).await {
            return self
                .fail(ctx, seq, format!("failed to persist HITL state: {}", e), content)
                .await;
        }

        self.clear_running(&ctx.conversation_id).await;
        tracing::info!(
            conversation_id = %ctx.conversation_id,
            request_id = %state.hitl_request_id,
            hitl_type = %state.hitl_type,
            sequence_number = seq.current(),
            "Turn paused for human input"
        );
        let mut result = ctx.result(seq, content);
        result.hitl_pending = true;
        result.hitl_request_id = Some(state.hitl_request_id);
        result
    }

    async fn fail(&self, ctx: &TurnContext, seq: &mut Sequencer, error: String, content: String) -> ChatResult {
        if let Err(e) = seq.emit("error", json!({ "error": error })).await {
            tracing::warn!(conversation_id = %ctx.conversation_id, "Failed to publish error event: {}", e);
        }
        self.clear_running(&ctx.conversation_id).await;
        tracing::warn!(
            conversation_id = %ctx.conversation_id,
            message_id = %ctx.message_id,
            "Turn failed: {}",
            error
        );
        let mut result = ctx.result(seq, content);
        result.is_error = true;
        result.error_message = Some(error);
        result
    }

    async fn cancelled(&self, ctx: &TurnContext, seq: &mut Sequencer, content: String) -> ChatResult {
        if let Err(e) = seq.emit("cancelled", json!({})).await {
            tracing::warn!(conversation_id = %ctx.conversation_id, "Failed to publish cancel event: {}", e);
        }
        self.clear_running(&ctx.conversation_id).await;
        tracing::info!(conversation_id = %ctx.conversation_id, message_id = %ctx.message_id, "Turn cancelled");
        let mut result = ctx.result(seq, content);
        result.is_error = true;
        result.error_message = Some("cancelled".to_string());
        result
    }

    /// Idle / Running / Paused
    pub async fn conversation_status(&self, conversation_id: &str) -> Result<ConversationStatus, HiveError> {
        if let Some(request_id) = self.hitl.pending_for_conversation(conversation_id).await? {
            return Ok(ConversationStatus::Paused { request_id });
        }
        match self.cache.get(&running_marker_key(conversation_id)).await? {
            Some(message_id) => Ok(ConversationStatus::Running { message_id }),
            None => Ok(ConversationStatus::Idle),
        }
    }
}
