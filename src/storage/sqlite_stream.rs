//! 持久化追加流的 SQLite 实现
//!
//! 三张表：
//! - `stream_entries`：(stream_key, id) 为主键的只追加记录
//! - `stream_groups`：每个消费组在每条通道上的已投递位置
//! - `stream_pending`：已投递未确认的条目（消费者、投递时间、投递次数）
//!
//! 进程内的写操作经一把异步锁串行，再包在事务里；跨进程写者由主键约束兜底。
//! 阻塞读在本进程追加时立即唤醒，其余情况按固定间隔轮询。

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use tokio::sync::{Mutex, Notify};

use super::stream::{stamp_sequence, StreamEntry, StreamId, StreamStore};
use crate::core::StoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn sql_id(id: StreamId) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn entry_from_row(key: &str, row: &SqliteRow) -> Result<StreamEntry, StoreError> {
    let id: i64 = row.try_get("id")?;
    let payload: String = row.try_get("payload")?;
    Ok(StreamEntry {
        key: key.to_string(),
        id: id.max(0) as StreamId,
        payload: serde_json::from_str(&payload)?,
    })
}

pub struct SqliteStreamStore {
    pool: SqlitePool,
    writes: Mutex<()>,
    appended: Notify,
}

impl SqliteStreamStore {
    /// 打开（或创建）数据库文件
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = SqlitePoolOptions::new()
            .max_connections(3)
            .connect(&db_url)
            .await?;
        Self::with_pool(pool).await
    }

    /// 内存数据库（单连接，连接不回收）
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            writes: Mutex::new(()),
            appended: Notify::new(),
        };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stream_entries (
                stream_key TEXT NOT NULL,
                id INTEGER NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (stream_key, id)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stream_groups (
                stream_key TEXT NOT NULL,
                group_name TEXT NOT NULL,
                last_delivered INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (stream_key, group_name)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS stream_pending (
                stream_key TEXT NOT NULL,
                group_name TEXT NOT NULL,
                id INTEGER NOT NULL,
                consumer TEXT NOT NULL,
                delivered_at INTEGER NOT NULL,
                deliveries INTEGER NOT NULL,
                PRIMARY KEY (stream_key, group_name, id)
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_entry(
        tx: &mut Transaction<'_, Sqlite>,
        key: &str,
        payload: &Value,
    ) -> Result<StreamId, StoreError> {
        let next: i64 = sqlx::query("SELECT COALESCE(MAX(id), 0) + 1 AS next FROM stream_entries WHERE stream_key = ?")
            .bind(key)
            .fetch_one(&mut **tx)
            .await?
            .try_get("next")?;
        sqlx::query("INSERT INTO stream_entries (stream_key, id, payload, created_at) VALUES (?, ?, ?, ?)")
            .bind(key)
            .bind(next)
            .bind(serde_json::to_string(payload)?)
            .bind(now_ms())
            .execute(&mut **tx)
            .await?;
        Ok(next.max(0) as StreamId)
    }

    async fn collect_new(
        &self,
        group: &str,
        consumer: &str,
        keys: &[String],
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let _write = self.writes.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = now_ms();
        let mut out = Vec::new();

        for key in keys {
            if out.len() >= count {
                break;
            }
            sqlx::query("INSERT OR IGNORE INTO stream_groups (stream_key, group_name, last_delivered) VALUES (?, ?, 0)")
                .bind(key)
                .bind(group)
                .execute(&mut *tx)
                .await?;
            let last_delivered: i64 =
                sqlx::query("SELECT last_delivered FROM stream_groups WHERE stream_key = ? AND group_name = ?")
                    .bind(key)
                    .bind(group)
                    .fetch_one(&mut *tx)
                    .await?
                    .try_get("last_delivered")?;

            let rows = sqlx::query("SELECT id, payload FROM stream_entries WHERE stream_key = ? AND id > ? ORDER BY id LIMIT ?")
                .bind(key)
                .bind(last_delivered)
                .bind(i64::try_from(count - out.len()).unwrap_or(i64::MAX))
                .fetch_all(&mut *tx)
                .await?;
            let Some(last_row) = rows.last() else {
                continue;
            };
            let newest: i64 = last_row.try_get("id")?;

            for row in &rows {
                let entry = entry_from_row(key, row)?;
                sqlx::query(
                    "INSERT OR REPLACE INTO stream_pending
                     (stream_key, group_name, id, consumer, delivered_at, deliveries)
                     VALUES (?, ?, ?, ?, ?, 1)",
                )
                .bind(key)
                .bind(group)
                .bind(sql_id(entry.id))
                .bind(consumer)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                out.push(entry);
            }
            sqlx::query("UPDATE stream_groups SET last_delivered = ? WHERE stream_key = ? AND group_name = ?")
                .bind(newest)
                .bind(key)
                .bind(group)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(out)
    }
}

#[async_trait]
impl StreamStore for SqliteStreamStore {
    async fn append(&self, key: &str, payload: Value) -> Result<StreamId, StoreError> {
        let id = {
            let _write = self.writes.lock().await;
            let mut tx = self.pool.begin().await?;
            let id = Self::insert_entry(&mut tx, key, &payload).await?;
            tx.commit().await?;
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
            let _write = self.writes.lock().await;
            let mut tx = self.pool.begin().await?;
            let tail = sqlx::query("SELECT id, payload FROM stream_entries WHERE stream_key = ? ORDER BY id DESC LIMIT 1")
                .bind(key)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| entry_from_row(key, &row))
                .transpose()?;
            let sequence = stamp_sequence(&mut payload, field, tail.as_ref().map(|e| &e.payload), floor)?;
            let id = Self::insert_entry(&mut tx, key, &payload).await?;
            tx.commit().await?;
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
            let entries = self.collect_new(group, consumer, keys, count.max(1)).await?;
            if !entries.is_empty() {
                return Ok(entries);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // 其他进程的追加只能靠轮询发现
            let _ = tokio::time::timeout((deadline - now).min(POLL_INTERVAL), notified).await;
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
        let _write = self.writes.lock().await;
        let mut tx = self.pool.begin().await?;
        let now = now_ms();
        let cutoff = now.saturating_sub(i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX));
        let mut out = Vec::new();

        for key in keys {
            if out.len() >= count {
                break;
            }
            let rows = sqlx::query(
                "SELECT p.id AS id, p.deliveries AS deliveries, e.payload AS payload
                 FROM stream_pending p
                 JOIN stream_entries e ON e.stream_key = p.stream_key AND e.id = p.id
                 WHERE p.stream_key = ? AND p.group_name = ? AND p.delivered_at <= ?
                 ORDER BY p.id LIMIT ?",
            )
            .bind(key)
            .bind(group)
            .bind(cutoff)
            .bind(i64::try_from(count - out.len()).unwrap_or(i64::MAX))
            .fetch_all(&mut *tx)
            .await?;

            for row in &rows {
                let entry = entry_from_row(key, row)?;
                let deliveries: i64 = row.try_get("deliveries")?;
                sqlx::query(
                    "UPDATE stream_pending SET consumer = ?, delivered_at = ?, deliveries = deliveries + 1
                     WHERE stream_key = ? AND group_name = ? AND id = ?",
                )
                .bind(consumer)
                .bind(now)
                .bind(key)
                .bind(group)
                .bind(sql_id(entry.id))
                .execute(&mut *tx)
                .await?;
                tracing::debug!(key = %key, id = entry.id, deliveries = deliveries + 1, "Reclaimed stale stream entry");
                out.push(entry);
            }
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn ack(&self, key: &str, group: &str, id: StreamId) -> Result<bool, StoreError> {
        let _write = self.writes.lock().await;
        let result = sqlx::query("DELETE FROM stream_pending WHERE stream_key = ? AND group_name = ? AND id = ?")
            .bind(key)
            .bind(group)
            .bind(sql_id(id))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn last_entry(&self, key: &str) -> Result<Option<StreamEntry>, StoreError> {
        sqlx::query("SELECT id, payload FROM stream_entries WHERE stream_key = ? ORDER BY id DESC LIMIT 1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| entry_from_row(key, &row))
            .transpose()
    }

    async fn range(&self, key: &str) -> Result<Vec<StreamEntry>, StoreError> {
        let rows = sqlx::query("SELECT id, payload FROM stream_entries WHERE stream_key = ? ORDER BY id")
            .bind(key)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|row| entry_from_row(key, row)).collect()
    }

    async fn pending_count(&self, key: &str, group: &str) -> Result<usize, StoreError> {
        let n: i64 = sqlx::query("SELECT COUNT(*) AS n FROM stream_pending WHERE stream_key = ? AND group_name = ?")
            .bind(key)
            .bind(group)
            .fetch_one(&self.pool)
            .await?
            .try_get("n")?;
        Ok(usize::try_from(n).unwrap_or(0))
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_log_and_group_state_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("streams.db");
        let keys = vec!["ch".to_string()];

        let store = SqliteStreamStore::open(&path).await.unwrap();
        store.append("ch", json!({"n": 1})).await.unwrap();
        store.append("ch", json!({"n": 2})).await.unwrap();
        let delivered = store
            .read_group("g", "c1", &keys, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(delivered.len(), 2);
        assert!(store.ack("ch", "g", delivered[0].id).await.unwrap());
        store.append_sequenced("log", "seq", 0, json!({})).await.unwrap();
        store.append_sequenced("log", "seq", 0, json!({})).await.unwrap();
        store.close().await;

        let reopened = SqliteStreamStore::open(&path).await.unwrap();
        assert_eq!(reopened.range("ch").await.unwrap().len(), 2);
        assert_eq!(reopened.pending_count("ch", "g").await.unwrap(), 1);

        // 已投递位置持久化：不会重复投递
        let again = reopened
            .read_group("g", "c1", &keys, 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(again.is_empty());

        // 未确认的条目可被另一个消费者认领
        let stale = reopened
            .claim_stale("g", "c2", &keys, Duration::ZERO, 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].payload, json!({"n": 2}));

        // 序号从持久化的尾部继续
        let (_, seq) = reopened.append_sequenced("log", "seq", 0, json!({})).await.unwrap();
        assert_eq!(seq, 3);
        reopened.close().await;
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let store = Arc::new(SqliteStreamStore::in_memory().await.unwrap());
        let reader = store.clone();
        let handle = tokio::spawn(async move {
            reader
                .read_group("g", "c", &["ch".to_string()], 1, Duration::from_secs(2))
                .await
                .unwrap()
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.append("ch", json!("hello")).await.unwrap();
        let got = handle.await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, json!("hello"));
    }

    #[tokio::test]
    async fn test_recent_pending_entries_are_not_claimed() {
        let store = SqliteStreamStore::in_memory().await.unwrap();
        let keys = vec!["ch".to_string()];
        store.append("ch", json!(1)).await.unwrap();
        store
            .read_group("g", "c1", &keys, 10, Duration::from_millis(10))
            .await
            .unwrap();

        let stale = store
            .claim_stale("g", "c2", &keys, Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(stale.is_empty());
        assert!(!store.ack("ch", "g", 42).await.unwrap());
        assert!(store.ack("ch", "g", 1).await.unwrap());
        assert_eq!(store.pending_count("ch", "g").await.unwrap(), 0);
    }
}
