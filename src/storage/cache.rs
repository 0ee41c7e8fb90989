//! 快速状态存储（键值 + TTL）
//!
//! 用于 HITL 状态主副本、运行中标记等短生命周期数据；过期即视为不存在。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::core::StoreError;

/// 快速存储接口
#[async_trait]
pub trait StateCache: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 删除键；返回删除前是否存在（用于原子认领）
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
}

/// 超出 Instant 可表示范围的 TTL 按一年计
fn expiry(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(365 * 24 * 3600))
}

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

/// 进程内实现
#[derive(Default)]
pub struct MemoryStateCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Unavailable("state cache lock poisoned".to_string()))
    }

    /// 清理已过期键，返回清理数量
    pub fn evict_expired(&self) -> usize {
        match self.lock() {
            Ok(mut entries) => {
                let before = entries.len();
                let now = Instant::now();
                entries.retain(|_, e| e.expires_at > now);
                before - entries.len()
            }
            Err(_) => 0,
        }
    }

    /// 模拟提前驱逐（测试降级路径）
    pub fn evict(&self, key: &str) {
        if let Ok(mut entries) = self.lock() {
            entries.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateCache for MemoryStateCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.lock()?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.lock()?;
        Ok(matches!(entries.remove(key), Some(e) if e.expires_at > Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ttl_expiry() {
        let cache = MemoryStateCache::new();
        cache.set("k", "v".into(), Duration::from_millis(30)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_reports_presence_once() {
        let cache = MemoryStateCache::new();
        cache.set("k", "v".into(), Duration::from_secs(5)).await.unwrap();
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_huge_ttl_does_not_overflow() {
        let cache = MemoryStateCache::new();
        cache.set("k", "v".into(), Duration::MAX).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
