//! HITL 响应路由
//!
//! 每个 (tenant, project) 一条持久化响应通道。路由 Actor 与本地降级消费者共用同一套
//! 消费循环：消费组读取（至少一次投递），解码后交给派发器，派发成功才确认。
//! 未确认的条目在空闲超过 `claim_idle` 后被重新认领；恢复是幂等的，重复投递安全。

pub mod fallback;
pub mod hitl_router;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub use fallback::{LocalFallbackConsumer, LocalResumeDispatcher};
pub use hitl_router::{ensure_router, HitlRouter, RegistryDispatcher, RouterDeps, RouterHandle, RouterStatus, ROUTER_NAME};

use crate::core::HiveError;
use crate::domain::HitlResponseMessage;
use crate::storage::{StreamEntry, StreamStore};

pub fn response_channel_key(tenant_id: &str, project_id: &str) -> String {
    format!("hitl:responses:{}:{}", tenant_id, project_id)
}

/// 监听中的通道集合（可并发增删）
#[derive(Clone, Default)]
pub struct ChannelSet {
    keys: Arc<RwLock<BTreeSet<String>>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回是否为新增
    pub async fn add(&self, tenant_id: &str, project_id: &str) -> bool {
        self.keys.write().await.insert(response_channel_key(tenant_id, project_id))
    }

    pub async fn remove(&self, tenant_id: &str, project_id: &str) -> bool {
        self.keys.write().await.remove(&response_channel_key(tenant_id, project_id))
    }

    pub async fn keys(&self) -> Vec<String> {
        self.keys.read().await.iter().cloned().collect()
    }
}

/// 把解码后的响应交给会话执行
#[async_trait]
pub trait ResponseDispatcher: Send + Sync {
    async fn dispatch(&self, msg: HitlResponseMessage) -> Result<(), HiveError>;
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    /// 每次读取的阻塞上限
    pub block: Duration,
    /// 未确认条目空闲多久后重新认领
    pub claim_idle: Duration,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            group: "hitl-router".to_string(),
            consumer: format!("consumer-{}", std::process::id()),
            batch_size: 10,
            block: Duration::from_millis(1000),
            claim_idle: Duration::from_secs(30),
        }
    }
}

/// 消费计数
#[derive(Debug, Default)]
pub struct ConsumerStats {
    received: AtomicU64,
    acked: AtomicU64,
    failed: AtomicU64,
    poison: AtomicU64,
    redelivered: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub received: u64,
    pub acked: u64,
    pub failed: u64,
    pub poison: u64,
    pub redelivered: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            poison: self.poison.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
        }
    }
}

/// 消费循环所需的一切
#[derive(Clone)]
pub struct ConsumerLoop {
    pub streams: Arc<dyn StreamStore>,
    pub channels: ChannelSet,
    pub settings: ConsumerSettings,
    pub dispatcher: Arc<dyn ResponseDispatcher>,
    pub stats: Arc<ConsumerStats>,
}

impl ConsumerLoop {
    /// 运行直到 cancel
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(group = %self.settings.group, consumer = %self.settings.consumer, "HITL consume loop started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let keys = self.channels.keys().await;
            if keys.is_empty() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.block) => continue,
                }
            }

            match self.poll(&keys, &cancel).await {
                Ok(entries) => {
                    for entry in entries {
                        self.process(entry).await;
                    }
                }
                Err(e) => {
                    tracing::warn!(channels = keys.len(), "HITL channel read failed: {}", e);
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.block) => {}
                    }
                }
            }
        }
        tracing::info!(group = %self.settings.group, consumer = %self.settings.consumer, "HITL consume loop stopped");
    }

    /// 先认领超时未确认的条目，再读取新条目
    async fn poll(&self, keys: &[String], cancel: &CancellationToken) -> Result<Vec<StreamEntry>, HiveError> {
        let s = &self.settings;
        let stale = self
            .streams
            .claim_stale(&s.group, &s.consumer, keys, s.claim_idle, s.batch_size)
            .await?;
        if !stale.is_empty() {
            self.stats.redelivered.fetch_add(stale.len() as u64, Ordering::Relaxed);
            tracing::info!(count = stale.len(), "Redelivering unacknowledged HITL responses");
            return Ok(stale);
        }

        tokio::select! {
            _ = cancel.cancelled() => Ok(Vec::new()),
            read = self.streams.read_group(&s.group, &s.consumer, keys, s.batch_size, s.block) => Ok(read?),
        }
    }

    /// 派发成功或负载无法解码时确认；派发失败保留在待确认列表中等待重投
    async fn process(&self, entry: StreamEntry) {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let msg = match HitlResponseMessage::decode(&entry.payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.stats.poison.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %entry.key, id = entry.id, "Dropping undecodable HITL response: {}", e);
                self.ack(&entry).await;
                return;
            }
        };

        let request_id = msg.request_id.clone();
        match self.dispatcher.dispatch(msg).await {
            Ok(()) => {
                self.ack(&entry).await;
                tracing::info!(key = %entry.key, id = entry.id, request_id = %request_id, "HITL response dispatched and acknowledged");
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    key = %entry.key,
                    id = entry.id,
                    request_id = %request_id,
                    "HITL dispatch failed, leaving unacknowledged for redelivery: {}",
                    e
                );
            }
        }
    }

    async fn ack(&self, entry: &StreamEntry) {
        match self.streams.ack(&entry.key, &self.settings.group, entry.id).await {
            Ok(_) => {
                self.stats.acked.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => tracing::warn!(key = %entry.key, id = entry.id, "HITL ack failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use serde_json::json;

    use crate::storage::MemoryStreamStore;

    /// 记录派发；前 `fail_first` 次返回错误
    struct RecordingDispatcher {
        seen: Mutex<Vec<String>>,
        fail_first: AtomicU64,
    }

    #[async_trait]
    impl ResponseDispatcher for RecordingDispatcher {
        async fn dispatch(&self, msg: HitlResponseMessage) -> Result<(), HiveError> {
            if self.fail_first.load(Ordering::SeqCst) > 0 {
                self.fail_first.fetch_sub(1, Ordering::SeqCst);
                return Err(HiveError::ActorStopped("session".into()));
            }
            self.seen.lock().unwrap().push(msg.request_id);
            Ok(())
        }
    }

    fn response(request_id: &str) -> serde_json::Value {
        json!({
            "request_id": request_id,
            "response_data": {"answer": "A"},
            "tenant_id": "t1",
            "project_id": "p1",
            "conversation_id": "c1",
            "agent_mode": "default"
        })
    }

    fn consumer(streams: Arc<MemoryStreamStore>, dispatcher: Arc<RecordingDispatcher>) -> ConsumerLoop {
        ConsumerLoop {
            streams,
            channels: ChannelSet::new(),
            settings: ConsumerSettings {
                block: Duration::from_millis(20),
                claim_idle: Duration::from_millis(50),
                ..Default::default()
            },
            dispatcher,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    #[tokio::test]
    async fn test_failed_dispatch_is_redelivered() {
        let streams = Arc::new(MemoryStreamStore::new());
        let dispatcher = Arc::new(RecordingDispatcher {
            seen: Mutex::new(Vec::new()),
            fail_first: AtomicU64::new(1),
        });
        let consumer = consumer(streams.clone(), dispatcher.clone());
        consumer.channels.add("t1", "p1").await;
        let key = response_channel_key("t1", "p1");
        streams.append(&key, response("hitl_1")).await.unwrap();

        let cancel = CancellationToken::new();
        let stats = consumer.stats.clone();
        let task = tokio::spawn(consumer.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(dispatcher.seen.lock().unwrap().as_slice(), ["hitl_1".to_string()]);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.acked, 1);
        assert!(snapshot.redelivered >= 1);
        assert_eq!(streams.pending_count(&key, "hitl-router").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poison_message_is_acknowledged() {
        let streams = Arc::new(MemoryStreamStore::new());
        let dispatcher = Arc::new(RecordingDispatcher {
            seen: Mutex::new(Vec::new()),
            fail_first: AtomicU64::new(0),
        });
        let consumer = consumer(streams.clone(), dispatcher.clone());
        consumer.channels.add("t1", "p1").await;
        let key = response_channel_key("t1", "p1");
        streams.append(&key, json!({"garbage": true})).await.unwrap();

        let cancel = CancellationToken::new();
        let stats = consumer.stats.clone();
        let task = tokio::spawn(consumer.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        assert!(dispatcher.seen.lock().unwrap().is_empty());
        assert_eq!(stats.snapshot().poison, 1);
        assert_eq!(streams.pending_count(&key, "hitl-router").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_channel_set_add_is_idempotent() {
        let channels = ChannelSet::new();
        assert!(channels.add("t1", "p1").await);
        assert!(!channels.add("t1", "p1").await);
        assert_eq!(channels.keys().await, vec!["hitl:responses:t1:p1".to_string()]);
        assert!(channels.remove("t1", "p1").await);
    }
}
