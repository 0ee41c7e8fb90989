//! Mock 智能体（用于测试与本地运行，无需 LLM）
//!
//! - EchoAgent：回显最后一条 user / tool 消息
//! - ScriptedAgent：按预置脚本逐轮执行（思考、回复、调用 MCP 工具、请求人类输入、失败）

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use serde_json::Value;
use tokio::sync::mpsc;

use super::{Agent, AgentError, AgentEvent, AgentFactory, AgentStream, HitlPending, TurnInput};
use crate::core::HiveError;
use crate::domain::{ActorIdentity, AgentExecutionConfig, HitlType, Message, Role};
use crate::mcp::{result_text, ConnectionManager};

/// 把 mpsc 接收端包装为事件流
fn channel_stream(rx: mpsc::Receiver<Result<AgentEvent, AgentError>>) -> AgentStream {
    Box::pin(stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// 取最后一条 user 或 tool 消息
fn last_input(messages: &[Message], fallback: &str) -> String {
    messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User | Role::Tool))
        .map(|m| m.content.clone())
        .unwrap_or_else(|| fallback.to_string())
}

/// 回显智能体
#[derive(Debug, Default)]
pub struct EchoAgent;

#[async_trait]
impl Agent for EchoAgent {
    fn stream(&self, input: TurnInput) -> AgentStream {
        let content = format!("Echo: {}", last_input(&input.messages, &input.user_message));
        Box::pin(stream::iter(vec![
            Ok(AgentEvent::MessageChunk {
                text: content.clone(),
            }),
            Ok(AgentEvent::Complete { content }),
        ]))
    }
}

/// 回显智能体工厂，记录创建次数
#[derive(Debug, Default)]
pub struct EchoAgentFactory {
    created: AtomicUsize,
}

impl EchoAgentFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentFactory for EchoAgentFactory {
    async fn create(
        &self,
        identity: &ActorIdentity,
        _config: &AgentExecutionConfig,
    ) -> Result<Arc<dyn Agent>, HiveError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(actor = %identity, "Created echo agent");
        Ok(Arc::new(EchoAgent))
    }
}

/// 脚本步骤
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Think(String),
    Say(String),
    /// 通过连接管理器调用 MCP 工具
    CallTool {
        server: String,
        tool: String,
        args: Value,
    },
    /// 请求人类输入（本轮暂停）
    AskHuman {
        hitl_type: HitlType,
        request_data: Value,
        timeout_seconds: u64,
    },
    /// 本轮以错误结束
    Fail(String),
    /// 等待一段时间（测试取消）
    Sleep(Duration),
}

/// 脚本智能体：每次 stream 消费一轮脚本；脚本耗尽后回显
pub struct ScriptedAgent {
    turns: Mutex<VecDeque<Vec<ScriptStep>>>,
    inputs: Mutex<Vec<TurnInput>>,
    tools: Option<Arc<ConnectionManager>>,
    max_steps: usize,
    stopped: AtomicUsize,
}

impl ScriptedAgent {
    pub fn new(turns: Vec<Vec<ScriptStep>>) -> Self {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            inputs: Mutex::new(Vec::new()),
            tools: None,
            max_steps: 20,
            stopped: AtomicUsize::new(0),
        }
    }

    pub fn with_tools(mut self, manager: Arc<ConnectionManager>) -> Self {
        self.tools = Some(manager);
        self
    }

    /// 追加一轮脚本
    pub fn push_turn(&self, steps: Vec<ScriptStep>) {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(steps);
        }
    }

    /// 已收到的全部输入（按调用顺序）
    pub fn inputs(&self) -> Vec<TurnInput> {
        self.inputs.lock().map(|i| i.clone()).unwrap_or_default()
    }

    pub fn stop_count(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }

    fn next_turn(&self) -> Option<Vec<ScriptStep>> {
        self.turns.lock().ok().and_then(|mut t| t.pop_front())
    }
}

async fn run_script(
    steps: Vec<ScriptStep>,
    input: TurnInput,
    tools: Option<Arc<ConnectionManager>>,
    max_steps: usize,
    tx: mpsc::Sender<Result<AgentEvent, AgentError>>,
) {
    let mut messages = input.messages.clone();
    let mut content = String::new();

    for (i, step) in steps.into_iter().enumerate() {
        let update = AgentEvent::StepUpdate {
            step: input.step_count + i + 1,
            max_steps,
        };
        if tx.send(Ok(update)).await.is_err() {
            return;
        }

        let event = match step {
            ScriptStep::Think(text) => AgentEvent::Thinking { text },
            ScriptStep::Say(text) => {
                content.push_str(&text);
                AgentEvent::MessageChunk { text }
            }
            ScriptStep::Sleep(d) => {
                tokio::time::sleep(d).await;
                continue;
            }
            ScriptStep::CallTool { server, tool, args } => {
                let call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
                let call = AgentEvent::ToolCall {
                    tool: tool.clone(),
                    call_id: call_id.clone(),
                    args: args.clone(),
                };
                if tx.send(Ok(call)).await.is_err() {
                    return;
                }
                let outcome = match &tools {
                    Some(manager) => manager
                        .call_tool(&server, &tool, args, None)
                        .await
                        .map(|v| result_text(&v))
                        .map_err(|e| e.to_string()),
                    None => Err("no tool connections configured".to_string()),
                };
                let (output, success) = match outcome {
                    Ok(out) => (out, true),
                    Err(e) => (e, false),
                };
                messages.push(Message::tool(&call_id, &output));
                AgentEvent::ToolResult {
                    tool,
                    call_id,
                    output,
                    success,
                }
            }
            ScriptStep::AskHuman {
                hitl_type,
                request_data,
                timeout_seconds,
            } => {
                let call_id = format!("call_{}", uuid::Uuid::new_v4().simple());
                let call = AgentEvent::ToolCall {
                    tool: "request_human_input".to_string(),
                    call_id: call_id.clone(),
                    args: request_data.clone(),
                };
                if tx.send(Ok(call)).await.is_err() {
                    return;
                }
                messages.push(Message::assistant(format!(
                    "[tool_call request_human_input {}]",
                    call_id
                )));
                let pending = HitlPending::new(hitl_type, request_data, messages)
                    .with_tool_call(call_id)
                    .with_timeout(timeout_seconds);
                let _ = tx.send(Err(AgentError::HitlPending(Box::new(pending)))).await;
                return;
            }
            ScriptStep::Fail(msg) => {
                let _ = tx.send(Err(AgentError::Llm(msg))).await;
                return;
            }
        };
        if tx.send(Ok(event)).await.is_err() {
            return;
        }
    }

    if content.is_empty() {
        content = format!("Echo: {}", last_input(&messages, &input.user_message));
    }
    let _ = tx.send(Ok(AgentEvent::Complete { content })).await;
}

#[async_trait]
impl Agent for ScriptedAgent {
    fn stream(&self, input: TurnInput) -> AgentStream {
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(input.clone());
        }
        let steps = self.next_turn().unwrap_or_default();
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(run_script(steps, input, self.tools.clone(), self.max_steps, tx));
        channel_stream(rx)
    }

    fn tool_count(&self) -> usize {
        usize::from(self.tools.is_some())
    }

    async fn stop(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

/// 共享同一脚本智能体的工厂（同一实例可跨会话 / 跨恢复观察输入）
pub struct ScriptedAgentFactory {
    agent: Arc<ScriptedAgent>,
    created: AtomicUsize,
    fail_with: Mutex<Option<String>>,
}

impl ScriptedAgentFactory {
    pub fn new(agent: Arc<ScriptedAgent>) -> Self {
        Self {
            agent,
            created: AtomicUsize::new(0),
            fail_with: Mutex::new(None),
        }
    }

    pub fn agent(&self) -> Arc<ScriptedAgent> {
        self.agent.clone()
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// 让后续 create 失败（None 恢复）
    pub fn fail_creation(&self, reason: Option<&str>) {
        if let Ok(mut f) = self.fail_with.lock() {
            *f = reason.map(str::to_string);
        }
    }
}

#[async_trait]
impl AgentFactory for ScriptedAgentFactory {
    async fn create(
        &self,
        identity: &ActorIdentity,
        _config: &AgentExecutionConfig,
    ) -> Result<Arc<dyn Agent>, HiveError> {
        if let Some(reason) = self.fail_with.lock().ok().and_then(|f| f.clone()) {
            return Err(HiveError::AgentInit(format!("{}: {}", identity, reason)));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(self.agent.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use serde_json::json;

    fn input(text: &str) -> TurnInput {
        TurnInput {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
            user_id: "u1".into(),
            user_message: text.into(),
            messages: vec![Message::user(text)],
            step_count: 0,
            correlation_id: None,
            overrides: None,
            resumed_request_id: None,
        }
    }

    #[tokio::test]
    async fn test_echo_agent_completes() {
        let events: Vec<_> = EchoAgent.stream(input("hi")).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events.last(),
            Some(Ok(AgentEvent::Complete { content })) if content == "Echo: hi"
        ));
    }

    #[tokio::test]
    async fn test_scripted_agent_pauses_with_context() {
        let agent = ScriptedAgent::new(vec![vec![
            ScriptStep::Think("need input".into()),
            ScriptStep::AskHuman {
                hitl_type: HitlType::Clarification,
                request_data: json!({"question": "which?", "options": ["A", "B"]}),
                timeout_seconds: 60,
            },
        ]]);
        let mut stream = agent.stream(input("start"));
        let mut last = None;
        while let Some(item) = stream.next().await {
            last = Some(item);
        }
        match last {
            Some(Err(AgentError::HitlPending(p))) => {
                assert_eq!(p.hitl_type, HitlType::Clarification);
                assert!(p.pending_tool_call_id.is_some());
                assert_eq!(p.messages.len(), 2);
                assert_eq!(p.timeout_seconds, 60);
            }
            other => panic!("expected pause, got {:?}", other),
        }
        assert_eq!(agent.inputs().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_factory_failure_injection() {
        let factory = ScriptedAgentFactory::new(Arc::new(ScriptedAgent::new(vec![])));
        let id = ActorIdentity::with_default_mode("t", "p");
        factory.fail_creation(Some("no key"));
        assert!(factory.create(&id, &AgentExecutionConfig::default()).await.is_err());
        factory.fail_creation(None);
        assert!(factory.create(&id, &AgentExecutionConfig::default()).await.is_ok());
        assert_eq!(factory.created(), 1);
    }
}
