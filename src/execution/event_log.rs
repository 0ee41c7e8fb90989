//! 会话事件日志：每个会话一条持久化流，序号由日志尾部推导
//!
//! 序号在写入时由流存储原子分配（尾部序号与本轮已见序号取大再加一），
//! 同一会话上并发的轮次因此共享一条严格递增的序列。写入失败时序号不前进。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::HiveError;
use crate::storage::StreamStore;

const SEQUENCE_FIELD: &str = "sequence_number";

pub fn event_log_key(conversation_id: &str) -> String {
    format!("agent:events:{}", conversation_id)
}

/// 持久化的单轮事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnEvent {
    pub sequence_number: u64,
    pub conversation_id: String,
    pub message_id: String,
    pub event_type: String,
    pub data: Value,
    /// 毫秒时间戳
    pub timestamp: i64,
}

#[derive(Clone)]
pub struct EventLog {
    streams: Arc<dyn StreamStore>,
}

impl EventLog {
    pub fn new(streams: Arc<dyn StreamStore>) -> Self {
        Self { streams }
    }

    /// 日志中已持久化的最大序号（空日志为 0）
    pub async fn last_sequence(&self, conversation_id: &str) -> Result<u64, HiveError> {
        let last = self.streams.last_entry(&event_log_key(conversation_id)).await?;
        Ok(last
            .and_then(|e| e.payload.get(SEQUENCE_FIELD).and_then(Value::as_u64))
            .unwrap_or(0))
    }

    /// 追加事件并返回分配到的序号（大于 `floor` 且大于日志尾部）
    pub async fn publish(&self, event: &TurnEvent, floor: u64) -> Result<u64, HiveError> {
        let payload = serde_json::to_value(event)?;
        let (_, sequence_number) = self
            .streams
            .append_sequenced(&event_log_key(&event.conversation_id), SEQUENCE_FIELD, floor, payload)
            .await?;
        Ok(sequence_number)
    }

    /// 会话全部事件（按写入顺序）
    pub async fn events(&self, conversation_id: &str) -> Result<Vec<TurnEvent>, HiveError> {
        let entries = self.streams.range(&event_log_key(conversation_id)).await?;
        entries
            .into_iter()
            .map(|e| serde_json::from_value(e.payload).map_err(HiveError::from))
            .collect()
    }
}

/// 单轮内的序号分配器
pub struct Sequencer {
    log: EventLog,
    conversation_id: String,
    message_id: String,
    current: u64,
    emitted: usize,
}

impl Sequencer {
    pub fn new(log: EventLog, conversation_id: &str, message_id: &str, start_after: u64) -> Self {
        Self {
            log,
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            current: start_after,
            emitted: 0,
        }
    }

    /// 最后一个已持久化事件的序号
    pub fn current(&self) -> u64 {
        self.current
    }

    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// 持久化事件并记录存储分配的序号；写入失败时序号不前进
    pub async fn emit(&mut self, event_type: &str, data: Value) -> Result<u64, HiveError> {
        let event = TurnEvent {
            sequence_number: 0,
            conversation_id: self.conversation_id.clone(),
            message_id: self.message_id.clone(),
            event_type: event_type.to_string(),
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let sequence_number = self.log.publish(&event, self.current).await?;
        self.current = sequence_number;
        self.emitted += 1;
        Ok(sequence_number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStreamStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_sequence_resumes_from_log_tail() {
        let log = EventLog::new(Arc::new(MemoryStreamStore::new()));
        assert_eq!(log.last_sequence("c1").await.unwrap(), 0);

        let mut seq = Sequencer::new(log.clone(), "c1", "m1", 0);
        seq.emit("turn_started", json!({})).await.unwrap();
        seq.emit("complete", json!({"content": "ok"})).await.unwrap();
        assert_eq!(seq.emitted(), 2);

        // 新的分配器（如重启后）从日志尾部继续
        let start = log.last_sequence("c1").await.unwrap();
        let mut next = Sequencer::new(log.clone(), "c1", "m2", start);
        assert_eq!(next.emit("turn_started", json!({})).await.unwrap(), 3);

        let numbers: Vec<u64> = log
            .events("c1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.sequence_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_interleaved_sequencers_share_one_sequence() {
        let log = EventLog::new(Arc::new(MemoryStreamStore::new()));
        // 两个轮次从同一个尾部起步
        let mut a = Sequencer::new(log.clone(), "c1", "m1", 0);
        let mut b = Sequencer::new(log.clone(), "c1", "m2", 0);

        assert_eq!(a.emit("turn_started", json!({})).await.unwrap(), 1);
        assert_eq!(b.emit("turn_started", json!({})).await.unwrap(), 2);
        assert_eq!(a.emit("complete", json!({})).await.unwrap(), 3);
        assert_eq!(b.emit("complete", json!({})).await.unwrap(), 4);
        assert_eq!(a.current(), 3);

        let events = log.events("c1").await.unwrap();
        let numbers: Vec<u64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert_eq!(events[1].message_id, "m2");
    }
}
