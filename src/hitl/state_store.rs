//! HITL 状态双写存储
//!
//! 暂停时同时写入快速存储（TTL = timeout + margin）与关系型快照（显式过期时间）。
//! 恢复时先查快速存储（有限次重试吸收复制延迟），未命中再回退到快照。
//! 认领（claim）以删除成功为准：同一 request_id 至多被一个恢复者认领。

use std::sync::Arc;
use std::time::Duration;

use crate::core::HiveError;
use crate::domain::HitlAgentState;
use crate::storage::{SnapshotRow, SnapshotStore, StateCache, HITL_SNAPSHOT_TYPE};

/// 状态缺失时对外的稳定错误文本
pub const STATE_NOT_FOUND: &str = "HITL state not found or expired";

/// 暂停状态保留的上限（timeout_seconds 由智能体给出，不可信）
pub const MAX_STATE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// 存储参数
#[derive(Debug, Clone)]
pub struct HitlStoreSettings {
    /// TTL 在 timeout_seconds 之上的余量
    pub ttl_margin: Duration,
    /// 快速存储未命中时的额外重试次数
    pub lookup_retries: u32,
    pub retry_delay: Duration,
}

impl Default for HitlStoreSettings {
    fn default() -> Self {
        Self {
            ttl_margin: Duration::from_secs(60),
            lookup_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// 状态来源，决定认领时以哪一份删除为准
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateSource {
    Cache,
    Snapshot,
}

fn state_key(conversation_id: &str, request_id: &str) -> String {
    format!("hitl:state:{}:{}", conversation_id, request_id)
}

fn request_index_key(request_id: &str) -> String {
    format!("hitl:request:{}", request_id)
}

fn conversation_index_key(conversation_id: &str) -> String {
    format!("hitl:conversation:{}", conversation_id)
}

pub struct HitlStateStore {
    cache: Arc<dyn StateCache>,
    snapshots: Arc<dyn SnapshotStore>,
    settings: HitlStoreSettings,
}

impl HitlStateStore {
    pub fn new(
        cache: Arc<dyn StateCache>,
        snapshots: Arc<dyn SnapshotStore>,
        settings: HitlStoreSettings,
    ) -> Self {
        Self {
            cache,
            snapshots,
            settings,
        }
    }

    pub fn settings(&self) -> &HitlStoreSettings {
        &self.settings
    }

    /// 双写暂停状态；两份都失败才返回错误
    pub async fn save(&self, state: &HitlAgentState) -> Result<(), HiveError> {
        let ttl = Duration::from_secs(state.timeout_seconds)
            .saturating_add(self.settings.ttl_margin)
            .min(MAX_STATE_TTL);
        let payload = serde_json::to_string(state)?;

        let cache_result = async {
            self.cache
                .set(
                    &state_key(&state.conversation_id, &state.hitl_request_id),
                    payload,
                    ttl,
                )
                .await?;
            self.cache
                .set(
                    &request_index_key(&state.hitl_request_id),
                    state.conversation_id.clone(),
                    ttl,
                )
                .await?;
            self.cache
                .set(
                    &conversation_index_key(&state.conversation_id),
                    state.hitl_request_id.clone(),
                    ttl,
                )
                .await
        }
        .await;

        let row = SnapshotRow {
            id: format!("snap_{}", uuid::Uuid::new_v4().simple()),
            tenant_id: state.tenant_id.clone(),
            project_id: state.project_id.clone(),
            agent_mode: state.agent_mode.clone(),
            request_id: state.hitl_request_id.clone(),
            snapshot_type: HITL_SNAPSHOT_TYPE.to_string(),
            payload: serde_json::to_value(state)?,
            created_at: state.created_at,
            expires_at: state
                .created_at
                .saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)),
        };
        let snapshot_result = self.snapshots.save(&row).await;

        match (cache_result, snapshot_result) {
            (Ok(()), Ok(())) => {
                tracing::info!(
                    conversation_id = %state.conversation_id,
                    request_id = %state.hitl_request_id,
                    hitl_type = %state.hitl_type,
                    ttl_secs = ttl.as_secs(),
                    "HITL state persisted"
                );
                Ok(())
            }
            (Err(e), Ok(())) => {
                tracing::warn!(request_id = %state.hitl_request_id, "Fast store write failed, snapshot only: {}", e);
                Ok(())
            }
            (Ok(()), Err(e)) => {
                tracing::warn!(request_id = %state.hitl_request_id, "Snapshot write failed, fast store only: {}", e);
                Ok(())
            }
            (Err(_), Err(e)) => Err(e.into()),
        }
    }

    async fn load_from_cache(&self, request_id: &str) -> Result<Option<HitlAgentState>, HiveError> {
        let Some(conversation_id) = self.cache.get(&request_index_key(request_id)).await? else {
            return Ok(None);
        };
        let Some(raw) = self.cache.get(&state_key(&conversation_id, request_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn load_from_snapshot(&self, request_id: &str) -> Result<Option<HitlAgentState>, HiveError> {
        let Some(row) = self.snapshots.latest_by_request(request_id).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(row.payload)?))
    }

    /// 查询状态：快速存储（有限次重试）→ 快照
    pub async fn load(&self, request_id: &str) -> Option<(HitlAgentState, StateSource)> {
        let attempts = self.settings.lookup_retries + 1;
        for attempt in 1..=attempts {
            match self.load_from_cache(request_id).await {
                Ok(Some(state)) => return Some((state, StateSource::Cache)),
                Ok(None) => {}
                Err(e) => tracing::warn!(request_id, attempt, "Fast store lookup failed: {}", e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }

        match self.load_from_snapshot(request_id).await {
            Ok(Some(state)) => {
                tracing::info!(request_id, "HITL state recovered from snapshot");
                Some((state, StateSource::Snapshot))
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(request_id, "Snapshot lookup failed: {}", e);
                None
            }
        }
    }

    /// 认领并删除状态；只有真正删除了来源副本的调用者拿到状态
    ///
    /// 来源为快速存储时先删快照再删主键，保证主键消失后快照也已不可见。
    pub async fn claim(&self, request_id: &str) -> Option<HitlAgentState> {
        let (state, source) = self.load(request_id).await?;

        let claimed = match source {
            StateSource::Cache => {
                self.delete_snapshot(request_id).await;
                match self
                    .cache
                    .delete(&state_key(&state.conversation_id, request_id))
                    .await
                {
                    Ok(deleted) => deleted,
                    Err(e) => {
                        tracing::warn!(request_id, "Fast store delete failed: {}", e);
                        false
                    }
                }
            }
            StateSource::Snapshot => {
                let rows = self.delete_snapshot(request_id).await;
                let _ = self
                    .cache
                    .delete(&state_key(&state.conversation_id, request_id))
                    .await;
                rows > 0
            }
        };

        let _ = self.cache.delete(&request_index_key(request_id)).await;
        let index_key = conversation_index_key(&state.conversation_id);
        if let Ok(Some(current)) = self.cache.get(&index_key).await {
            if current == request_id {
                let _ = self.cache.delete(&index_key).await;
            }
        }

        if claimed {
            tracing::info!(
                conversation_id = %state.conversation_id,
                request_id,
                source = ?source,
                "HITL state claimed and deleted"
            );
            Some(state)
        } else {
            tracing::info!(request_id, "HITL state already claimed by another resume");
            None
        }
    }

    async fn delete_snapshot(&self, request_id: &str) -> u64 {
        match self.snapshots.delete_by_request(request_id).await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(request_id, "Snapshot delete failed: {}", e);
                0
            }
        }
    }

    /// 会话当前等待中的 request_id（状态记录存在即暂停）
    pub async fn pending_for_conversation(&self, conversation_id: &str) -> Result<Option<String>, HiveError> {
        let Some(request_id) = self.cache.get(&conversation_index_key(conversation_id)).await? else {
            return Ok(None);
        };
        let present = self
            .cache
            .get(&state_key(conversation_id, &request_id))
            .await?
            .is_some();
        if present {
            return Ok(Some(request_id));
        }
        let in_snapshot = self.snapshots.latest_by_request(&request_id).await?.is_some();
        Ok(in_snapshot.then_some(request_id))
    }

    /// 仍有未过期暂停快照的 (tenant_id, project_id)
    pub async fn pending_projects(&self) -> Result<Vec<(String, String)>, HiveError> {
        Ok(self.snapshots.pending_projects().await?)
    }

    /// 清理过期快照行
    pub async fn purge_expired(&self) -> Result<u64, HiveError> {
        Ok(self.snapshots.purge_expired().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HitlType, Message};
    use crate::storage::{MemoryStateCache, SqliteSnapshotStore};
    use serde_json::json;

    fn state(request_id: &str) -> HitlAgentState {
        HitlAgentState {
            conversation_id: "conv_1".into(),
            message_id: "msg_1".into(),
            tenant_id: "t1".into(),
            project_id: "p1".into(),
            agent_mode: "default".into(),
            hitl_request_id: request_id.into(),
            hitl_type: HitlType::Decision,
            request_data: json!({"options": ["yes", "no"]}),
            messages: vec![Message::user("deploy?")],
            user_message: "deploy?".into(),
            user_id: "u1".into(),
            correlation_id: None,
            step_count: 2,
            timeout_seconds: 60,
            pending_tool_call_id: Some("call_1".into()),
            last_sequence_number: 4,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    async fn store() -> (HitlStateStore, Arc<MemoryStateCache>) {
        let cache = Arc::new(MemoryStateCache::new());
        let snapshots = Arc::new(SqliteSnapshotStore::in_memory().await.unwrap());
        let settings = HitlStoreSettings {
            retry_delay: Duration::from_millis(5),
            ..Default::default()
        };
        (HitlStateStore::new(cache.clone(), snapshots, settings), cache)
    }

    #[tokio::test]
    async fn test_claim_is_at_most_once() {
        let (store, _) = store().await;
        store.save(&state("req_1")).await.unwrap();
        assert_eq!(
            store.pending_for_conversation("conv_1").await.unwrap().as_deref(),
            Some("req_1")
        );

        let first = store.claim("req_1").await;
        assert_eq!(first.map(|s| s.last_sequence_number), Some(4));
        assert!(store.claim("req_1").await.is_none());
        assert!(store.pending_for_conversation("conv_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_fallback_after_eviction() {
        let (store, cache) = store().await;
        store.save(&state("req_2")).await.unwrap();
        cache.evict(&state_key("conv_1", "req_2"));

        let (loaded, source) = store.load("req_2").await.unwrap();
        assert_eq!(source, StateSource::Snapshot);
        assert_eq!(loaded.pending_tool_call_id.as_deref(), Some("call_1"));

        assert!(store.claim("req_2").await.is_some());
        assert!(store.load("req_2").await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_claims_single_winner() {
        let (store, _) = store().await;
        let store = Arc::new(store);
        store.save(&state("req_3")).await.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = store.clone();
                tokio::spawn(async move { s.claim("req_3").await.is_some() })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_is_clamped() {
        let (store, cache) = store().await;
        let mut forever = state("req_4");
        forever.timeout_seconds = u64::MAX;
        store.save(&forever).await.unwrap();

        cache.evict(&state_key("conv_1", "req_4"));
        let (loaded, source) = store.load("req_4").await.unwrap();
        assert_eq!(source, StateSource::Snapshot);
        assert_eq!(loaded.timeout_seconds, u64::MAX);

        let row = store.snapshots.latest_by_request("req_4").await.unwrap().unwrap();
        assert_eq!(row.expires_at - row.created_at, MAX_STATE_TTL.as_millis() as i64);
        assert_eq!(
            store.pending_projects().await.unwrap(),
            vec![("t1".to_string(), "p1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unknown_request_bounded() {
        let (store, _) = store().await;
        let started = std::time::Instant::now();
        assert!(store.load("missing").await.is_none());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
