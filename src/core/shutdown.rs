//! 优雅关闭
//!
//! 统一监听关闭信号并按注册顺序执行清理（每项有超时）：
//! 先停止 HITL 消费者与会话 Actor（在途轮次被取消，已持久化的事件保留），
//! 再清理快照存储并关闭 SQLite 连接池。

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::hive::Hive;
use crate::storage::{SnapshotStore, StreamStore};

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
    /// 致命错误
    Fatal(String),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Interrupt => f.write_str("interrupt"),
            ShutdownReason::Terminate => f.write_str("terminate"),
            ShutdownReason::Fatal(msg) => write!(f, "fatal: {}", msg),
        }
    }
}

/// 关闭信号：第一次触发的原因被保留
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
    reason: Arc<Mutex<Option<ShutdownReason>>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 关闭时被取消的 token
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn trigger(&self, reason: ShutdownReason) {
        if let Ok(mut slot) = self.reason.lock() {
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.lock().ok().and_then(|r| r.clone())
    }

    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// 安装 Ctrl+C 与 SIGTERM 处理器
    pub fn install_signal_handlers(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                manager.trigger(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = self.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    manager.trigger(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 关闭时执行的清理项
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 单项清理的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Done,
    Failed(String),
    TimedOut,
}

/// 按注册顺序执行清理，每项单独计时
pub struct ShutdownCoordinator {
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    per_task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(per_task_timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            per_task_timeout,
        }
    }

    pub fn register(&mut self, task: impl ShutdownCleanup + 'static) {
        self.tasks.push(Arc::new(task));
    }

    pub async fn run_cleanup(&self) -> Vec<(&'static str, CleanupOutcome)> {
        tracing::info!(tasks = self.tasks.len(), "Running shutdown cleanup");
        let mut report = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let name = task.name();
            let outcome = match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!(task = name, "Cleanup completed");
                    CleanupOutcome::Done
                }
                Ok(Err(e)) => {
                    tracing::warn!(task = name, "Cleanup failed: {}", e);
                    CleanupOutcome::Failed(e.to_string())
                }
                Err(_) => {
                    tracing::warn!(task = name, timeout_secs = self.per_task_timeout.as_secs(), "Cleanup timed out");
                    CleanupOutcome::TimedOut
                }
            };
            report.push((name, outcome));
        }
        report
    }
}

/// 停止 HITL 消费者、关闭会话 Actor、断开 MCP 服务器
pub struct HiveCleanup {
    hive: Arc<Hive>,
}

impl HiveCleanup {
    pub fn new(hive: Arc<Hive>) -> Self {
        Self { hive }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for HiveCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.hive.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "hive"
    }
}

/// 删除过期快照行并关闭连接池
pub struct SnapshotStoreCleanup {
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotStoreCleanup {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for SnapshotStoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let purged = self.store.purge_expired().await?;
        tracing::debug!(purged, "Expired HITL snapshots removed before close");
        self.store.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "snapshot_store"
    }
}

/// 关闭事件流存储的连接池（需在会话与消费者停止之后执行）
pub struct StreamStoreCleanup {
    store: Arc<dyn StreamStore>,
}

impl StreamStoreCleanup {
    pub fn new(store: Arc<dyn StreamStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for StreamStoreCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.store.close().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stream_store"
    }
}

/// 运行直到 `app` 结束或收到关闭信号，然后执行清理
pub async fn run_until_shutdown<F>(manager: &ShutdownManager, app: F, coordinator: &ShutdownCoordinator)
where
    F: Future<Output = ()>,
{
    manager.install_signal_handlers();
    tokio::select! {
        _ = app => tracing::info!("Application finished"),
        _ = manager.wait() => {
            let reason = manager.reason().map(|r| r.to_string()).unwrap_or_default();
            tracing::info!(reason = %reason, "Shutdown signal received");
        }
    }
    coordinator.run_cleanup().await;
}
