//! 后台任务表：按逻辑 ID（message_id / request_id）登记可取消的后台单元
//!
//! 每个单元持有根 token 的子 token；按会话取消、全部取消与关闭时 join 均基于此表。
//! 同一 key 正在运行时拒绝重复登记，调用方据此把重复投递视为无操作。

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// 新一轮对话
    Chat,
    /// HITL 恢复
    Resume,
}

/// 登记中的后台单元
struct TrackedTask {
    kind: TaskKind,
    conversation_id: Option<String>,
    token: CancellationToken,
    handle: JoinHandle<()>,
    started_at: Instant,
}

/// 对外可见的任务摘要
#[derive(Clone, Debug)]
pub struct TaskSummary {
    pub key: String,
    pub kind: TaskKind,
    pub conversation_id: Option<String>,
    pub running_for: Duration,
}

/// 后台任务表（由单个 Actor 独占，无需加锁）
pub struct TaskTracker {
    root: CancellationToken,
    tasks: HashMap<String, TrackedTask>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            tasks: HashMap::new(),
        }
    }

    /// 登记并启动后台单元；key 已在运行时返回 false 且不启动
    pub fn spawn<F, Fut>(
        &mut self,
        key: impl Into<String>,
        kind: TaskKind,
        conversation_id: Option<String>,
        make: F,
    ) -> bool
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = key.into();
        if let Some(existing) = self.tasks.get(&key) {
            if !existing.handle.is_finished() {
                return false;
            }
        }

        let token = self.root.child_token();
        let handle = tokio::spawn(make(token.clone()));
        self.tasks.insert(
            key,
            TrackedTask {
                kind,
                conversation_id,
                token,
                handle,
                started_at: Instant::now(),
            },
        );
        true
    }

    /// 单元结束后移除登记
    pub fn finish(&mut self, key: &str) -> Option<TaskKind> {
        self.tasks.remove(key).map(|t| t.kind)
    }

    /// 取消属于某会话的全部单元，返回取消数量
    pub fn cancel_conversation(&mut self, conversation_id: &str) -> usize {
        let mut cancelled = 0;
        for task in self.tasks.values() {
            if task.conversation_id.as_deref() == Some(conversation_id) && !task.token.is_cancelled() {
                task.token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// 取消全部单元（关闭时使用）
    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// 等待全部单元结束；超时后强制 abort 剩余单元
    pub async fn join_all(&mut self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        for (key, task) in self.tasks.drain() {
            let mut handle = task.handle;
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(task = %key, "Background task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.tasks.contains_key(key)
    }

    /// 仍在运行的单元数
    pub fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| !t.handle.is_finished()).count()
    }

    pub fn summaries(&self) -> Vec<TaskSummary> {
        self.tasks
            .iter()
            .map(|(key, t)| TaskSummary {
                key: key.clone(),
                kind: t.kind,
                conversation_id: t.conversation_id.clone(),
                running_for: t.started_at.elapsed(),
            })
            .collect()
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}
