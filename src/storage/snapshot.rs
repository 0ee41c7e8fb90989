//! 关系型快照存储（SQLite）
//!
//! 行结构：(id, tenant_id, project_id, agent_mode, request_id, type, payload, created_at, expires_at)。
//! 作为快速存储之外的恢复路径：按 request_id 取最新且未过期的一行，按 request_id 删除。

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::core::StoreError;

/// HITL 暂停快照的行类型
pub const HITL_SNAPSHOT_TYPE: &str = "hitl_pending";

/// 快照行
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub agent_mode: String,
    pub request_id: String,
    pub snapshot_type: String,
    pub payload: Value,
    /// 毫秒时间戳
    pub created_at: i64,
    /// 毫秒时间戳；过期行在查询时被忽略
    pub expires_at: i64,
}

/// 快照存储接口
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, row: &SnapshotRow) -> Result<(), StoreError>;

    /// 按 request_id 查询最新且未过期的一行
    async fn latest_by_request(&self, request_id: &str) -> Result<Option<SnapshotRow>, StoreError>;

    /// 删除 request_id 的全部行，返回删除行数
    async fn delete_by_request(&self, request_id: &str) -> Result<u64, StoreError>;

    /// 删除全部过期行
    async fn purge_expired(&self) -> Result<u64, StoreError>;

    /// 存在未过期行的 (tenant_id, project_id)，用于重启后恢复响应通道
    async fn pending_projects(&self) -> Result<Vec<(String, String)>, StoreError>;

    /// 释放连接
    async fn close(&self) {}
}

/// SQLite 实现
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    /// 打开（或创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    /// 内存数据库（单连接，连接不回收）
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_snapshots (
                id TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                project_id TEXT NOT NULL,
                agent_mode TEXT NOT NULL,
                request_id TEXT NOT NULL,
                type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_request ON agent_snapshots(request_id, created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_expiry ON agent_snapshots(expires_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn save(&self, row: &SnapshotRow) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&row.payload)?;
        sqlx::query(
            "INSERT OR REPLACE INTO agent_snapshots
             (id, tenant_id, project_id, agent_mode, request_id, type, payload, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.id)
        .bind(&row.tenant_id)
        .bind(&row.project_id)
        .bind(&row.agent_mode)
        .bind(&row.request_id)
        .bind(&row.snapshot_type)
        .bind(&payload)
        .bind(row.created_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_by_request(&self, request_id: &str) -> Result<Option<SnapshotRow>, StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let row = sqlx::query(
            "SELECT id, tenant_id, project_id, agent_mode, request_id, type, payload, created_at, expires_at
             FROM agent_snapshots
             WHERE request_id = ? AND expires_at > ?
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(request_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let payload: String = row.try_get("payload")?;
        Ok(Some(SnapshotRow {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            project_id: row.try_get("project_id")?,
            agent_mode: row.try_get("agent_mode")?,
            request_id: row.try_get("request_id")?,
            snapshot_type: row.try_get("type")?,
            payload: serde_json::from_str(&payload)?,
            created_at: row.try_get("created_at")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    async fn delete_by_request(&self, request_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM agent_snapshots WHERE request_id = ?")
            .bind(request_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let result = sqlx::query("DELETE FROM agent_snapshots WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?;
        let purged = result.rows_affected();
        if purged > 0 {
            tracing::info!("Purged {} expired snapshot rows", purged);
        }
        Ok(purged)
    }

    async fn pending_projects(&self) -> Result<Vec<(String, String)>, StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let rows = sqlx::query(
            "SELECT DISTINCT tenant_id, project_id FROM agent_snapshots
             WHERE expires_at > ?
             ORDER BY tenant_id, project_id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<(String, String), StoreError> {
                Ok((row.try_get("tenant_id")?, row.try_get("project_id")?))
            })
            .collect()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(id: &str, request_id: &str, created_at: i64, expires_at: i64) -> SnapshotRow {
        SnapshotRow {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            project_id: "p1".to_string(),
            agent_mode: "default".to_string(),
            request_id: request_id.to_string(),
            snapshot_type: HITL_SNAPSHOT_TYPE.to_string(),
            payload: json!({"id": id}),
            created_at,
            expires_at,
        }
    }

    #[tokio::test]
    async fn test_latest_row_wins_and_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("snapshots.db");
        let future = chrono::Utc::now().timestamp_millis() + 60_000;

        let store = SqliteSnapshotStore::open(&db_path).await.unwrap();
        store.save(&row("s1", "req_1", 1, future)).await.unwrap();
        store.save(&row("s2", "req_1", 2, future)).await.unwrap();
        store.close().await;

        let reopened = SqliteSnapshotStore::open(&db_path).await.unwrap();
        let latest = reopened.latest_by_request("req_1").await.unwrap().unwrap();
        assert_eq!(latest.id, "s2");
        assert_eq!(latest.payload, json!({"id": "s2"}));

        assert_eq!(reopened.delete_by_request("req_1").await.unwrap(), 2);
        assert!(reopened.latest_by_request("req_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_rows_are_invisible() {
        let store = SqliteSnapshotStore::in_memory().await.unwrap();
        let past = chrono::Utc::now().timestamp_millis() - 1;
        store.save(&row("old", "req_2", 1, past)).await.unwrap();
        assert!(store.latest_by_request("req_2").await.unwrap().is_none());
        assert!(store.pending_projects().await.unwrap().is_empty());
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }
}
