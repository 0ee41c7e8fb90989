//! 持久化追加流（带消费组语义）
//!
//! 每个 key 是一条只追加的有序通道。消费组维护“已投递位置”与未确认（pending）表：
//! read_group 只投递新条目；ack 之前条目保留在 pending 中，可被 claim_stale 重新投递。

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Notify;

use crate::core::StoreError;

/// 通道内条目 ID（单调递增）
pub type StreamId = u64;

/// 流条目
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub key: String,
    pub id: StreamId,
    pub payload: Value,
}

/// 持久化流存储接口
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// 追加一条记录，返回其 ID
    async fn append(&self, key: &str, payload: Value) -> Result<StreamId, StoreError>;

    /// 带序号追加：在同一临界区内读取尾部记录的 `field`，
    /// 取 `max(尾部序号, floor) + 1` 写入负载后追加。返回 (条目 ID, 分配的序号)。
    ///
    /// 同一通道的并发写者因此不会拿到重复或回退的序号。
    async fn append_sequenced(
        &self,
        key: &str,
        field: &str,
        floor: u64,
        payload: Value,
    ) -> Result<(StreamId, u64), StoreError>;

    /// 以消费组身份读取新条目；无新条目时最多阻塞 `block`
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// 认领空闲超过 `min_idle` 的未确认条目（重投递）
    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// 确认条目已处理
    async fn ack(&self, key: &str, group: &str, id: StreamId) -> Result<bool, StoreError>;

    /// 通道最后一条记录
    async fn last_entry(&self, key: &str) -> Result<Option<StreamEntry>, StoreError>;

    /// 通道全部记录（按 ID 升序）
    async fn range(&self, key: &str) -> Result<Vec<StreamEntry>, StoreError>;

    /// 某消费组在通道上的未确认条目数
    async fn pending_count(&self, key: &str, group: &str) -> Result<usize, StoreError>;

    /// 释放底层连接
    async fn close(&self) {}
}

/// 将序号写入负载；负载必须是 JSON 对象
pub(crate) fn stamp_sequence(
    payload: &mut Value,
    field: &str,
    tail: Option<&Value>,
    floor: u64,
) -> Result<u64, StoreError> {
    let tail_seq = tail.and_then(|v| v.get(field)).and_then(Value::as_u64).unwrap_or(0);
    let next = tail_seq.max(floor) + 1;
    let object = payload
        .as_object_mut()
        .ok_or_else(|| StoreError::InvalidRecord(format!("sequenced payload must be an object (field {})", field)))?;
    object.insert(field.to_string(), Value::from(next));
    Ok(next)
}

struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Default)]
struct GroupState {
    last_delivered: StreamId,
    pending: BTreeMap<StreamId, PendingEntry>,
}

#[derive(Default)]
struct Channel {
    next_id: StreamId,
    entries: BTreeMap<StreamId, Value>,
    groups: HashMap<String, GroupState>,
}

/// 进程内实现（测试与单机部署）
#[derive(Default)]
pub struct MemoryStreamStore {
    channels: Mutex<HashMap<String, Channel>>,
    appended: Notify,
}

impl MemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Channel>>, StoreError> {
        self.channels
            .lock()
            .map_err(|_| StoreError::Unavailable("stream store lock poisoned".to_string()))
    }

    fn collect_new(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut channels = self.lock()?;
        let mut out = Vec::new();
        for key in keys {
            if out.len() >= count {
                break;
            }
            let channel = channels.entry(key.clone()).or_default();
            let state = channel.groups.entry(group.to_string()).or_default();
            let fresh: Vec<(StreamId, Value)> = channel
                .entries
                .range(state.last_delivered + 1..)
                .take(count - out.len())
                .map(|(id, v)| (*id, v.clone()))
                .collect();
            for (id, payload) in fresh {
                state.last_delivered = id;
                state.pending.insert(
                    id,
                    PendingEntry {
                        consumer: consumer.to_string(),
                        delivered_at: Instant::now(),
                        deliveries: 1,
                    },
                );
                out.push(StreamEntry {
                    key: key.clone(),
                    id,
                    payload,
                });
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn append(&self, key: &str, payload: Value) -> Result<StreamId, StoreError> {
        let id = {
            let mut channels = self.lock()?;
            let channel = channels.entry(key.to_string()).or_default();
            channel.next_id += 1;
            let id = channel.next_id;
            channel.entries.insert(id, payload);
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn append_sequenced(
        &self,
        key: &str,
        field: &str,
        floor: u64,
        mut payload: Value,
    ) -> Result<(StreamId, u64), StoreError> {
        let assigned = {
            let mut channels = self.lock()?;
            let channel = channels.entry(key.to_string()).or_default();
            let sequence = stamp_sequence(&mut payload, field, channel.entries.values().next_back(), floor)?;
            channel.next_id += 1;
            let id = channel.next_id;
            channel.entries.insert(id, payload);
            (id, sequence)
        };
        self.appended.notify_waiters();
        Ok(assigned)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            let entries = self.collect_new(group, consumer, keys, count.max(1))?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut channels = self.lock()?;
        let mut out = Vec::new();
        for key in keys {
            let Some(channel) = channels.get_mut(key) else {
                continue;
            };
            let Some(state) = channel.groups.get_mut(group) else {
                continue;
            };
            for (id, pending) in state.pending.iter_mut() {
                if out.len() >= count {
                    return Ok(out);
                }
                if pending.delivered_at.elapsed() < min_idle {
                    continue;
                }
                let Some(payload) = channel.entries.get(id) else {
                    continue;
                };
                pending.consumer = consumer.to_string();
                pending.delivered_at = Instant::now();
                pending.deliveries += 1;
                tracing::debug!(key = %key, id = *id, deliveries = pending.deliveries, "Reclaimed stale stream entry");
                out.push(StreamEntry {
                    key: key.clone(),
                    id: *id,
                    payload: payload.clone(),
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, key: &str, group: &str, id: StreamId) -> Result<bool, StoreError> {
        let mut channels = self.lock()?;
        Ok(channels
            .get_mut(key)
            .and_then(|c| c.groups.get_mut(group))
            .map(|g| g.pending.remove(&id).is_some())
            .unwrap_or(false))
    }

    async fn last_entry(&self, key: &str) -> Result<Option<StreamEntry>, StoreError> {
        let channels = self.lock()?;
        Ok(channels.get(key).and_then(|c| {
            c.entries.iter().next_back().map(|(id, payload)| StreamEntry {
                key: key.to_string(),
                id: *id,
                payload: payload.clone(),
            })
        }))
    }

    async fn range(&self, key: &str) -> Result<Vec<StreamEntry>, StoreError> {
        let channels = self.lock()?;
        Ok(channels
            .get(key)
            .map(|c| {
                c.entries
                    .iter()
                    .map(|(id, payload)| StreamEntry {
                        key: key.to_string(),
                        id: *id,
                        payload: payload.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pending_count(&self, key: &str, group: &str) -> Result<usize, StoreError> {
        let channels = self.lock()?;
        Ok(channels
            .get(key)
            .and_then(|c| c.groups.get(group))
            .map(|g| g.pending.len())
            .unwrap_or(0))
    }
}
