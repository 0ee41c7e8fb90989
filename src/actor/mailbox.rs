//! Actor 邮箱：有界 mpsc + 单任务顺序处理
//!
//! 每个 Actor 一次只处理一条消息；handle 中的 panic 被捕获并计入重启预算，
//! 超出 `max_restarts` 后 Actor 停止，邮箱关闭。

use std::panic::AssertUnwindSafe;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::core::HiveError;

/// 邮箱参数
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    /// 待处理消息上限（同一 Actor 的并发调用上限）
    pub capacity: usize,
    /// 允许的 panic 恢复次数
    pub max_restarts: u32,
    /// ask 的默认等待上限
    pub invoke_timeout: Option<Duration>,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            max_restarts: 3,
            invoke_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// 处理消息时可用的上下文
pub struct ActorContext<M> {
    name: String,
    myself: mpsc::WeakSender<M>,
    stop: CancellationToken,
}

impl<M> ActorContext<M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 指向自身邮箱的发送端（Actor 已停止时为 None）
    pub fn myself(&self) -> Option<mpsc::Sender<M>> {
        self.myself.upgrade()
    }

    /// 处理完当前消息后停止
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Send + 'static;

    async fn handle(&mut self, msg: Self::Message, ctx: &ActorContext<Self::Message>);

    async fn on_start(&mut self, _ctx: &ActorContext<Self::Message>) {}

    /// panic 恢复后调用
    async fn on_restart(&mut self, _ctx: &ActorContext<Self::Message>) {}

    async fn on_stop(&mut self) {}
}

/// 邮箱句柄（可克隆）
pub struct Mailbox<M> {
    name: String,
    tx: mpsc::Sender<M>,
    stop: CancellationToken,
    invoke_timeout: Option<Duration>,
}

impl<M> Clone for Mailbox<M> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tx: self.tx.clone(),
            stop: self.stop.clone(),
            invoke_timeout: self.invoke_timeout,
        }
    }
}

impl<M: Send + 'static> Mailbox<M> {
    /// 启动 Actor 任务
    pub fn spawn<A>(name: impl Into<String>, mut actor: A, config: &MailboxConfig) -> Self
    where
        A: Actor<Message = M>,
    {
        let name = name.into();
        let (tx, mut rx) = mpsc::channel(config.capacity.max(1));
        let stop = CancellationToken::new();
        let ctx = ActorContext {
            name: name.clone(),
            myself: tx.downgrade(),
            stop: stop.clone(),
        };
        let max_restarts = config.max_restarts;

        tokio::spawn(async move {
            tracing::debug!(actor = %ctx.name, "Actor started");
            actor.on_start(&ctx).await;
            let mut restarts = 0u32;
            loop {
                let msg = tokio::select! {
                    biased;
                    _ = ctx.stop.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(m) => m,
                        None => break,
                    },
                };

                let outcome = AssertUnwindSafe(actor.handle(msg, &ctx)).catch_unwind().await;
                if outcome.is_err() {
                    restarts += 1;
                    if restarts > max_restarts {
                        tracing::error!(actor = %ctx.name, restarts, "Actor panicked beyond restart budget, stopping");
                        break;
                    }
                    tracing::warn!(actor = %ctx.name, restarts, "Actor panicked while handling a message, restarting");
                    actor.on_restart(&ctx).await;
                }
            }
            rx.close();
            actor.on_stop().await;
            tracing::debug!(actor = %ctx.name, "Actor stopped");
        });

        Self {
            name,
            tx,
            stop,
            invoke_timeout: config.invoke_timeout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_alive(&self) -> bool {
        !self.tx.is_closed() && !self.stop.is_cancelled()
    }

    /// 强制停止（不等待在途消息）
    pub fn kill(&self) {
        self.stop.cancel();
    }

    /// 投递消息，不等待结果
    pub async fn tell(&self, msg: M) -> Result<(), HiveError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| HiveError::ActorStopped(self.name.clone()))
    }

    /// 请求-响应，使用默认超时
    pub async fn ask<R>(&self, make: impl FnOnce(oneshot::Sender<R>) -> M) -> Result<R, HiveError> {
        self.ask_with_timeout(make, self.invoke_timeout).await
    }

    pub async fn ask_with_timeout<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<R>) -> M,
        timeout: Option<Duration>,
    ) -> Result<R, HiveError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tell(make(reply_tx)).await?;
        let reply = async {
            reply_rx
                .await
                .map_err(|_| HiveError::ActorStopped(self.name.clone()))
        };
        match timeout {
            Some(t) => tokio::time::timeout(t, reply)
                .await
                .map_err(|_| HiveError::InvokeTimeout(self.name.clone()))?,
            None => reply.await,
        }
    }
}
