//! 存储层：持久化追加流、快速状态存储（TTL）、关系型快照
//!
//! 三者均为外部协作方的抽象；进程内实现用于测试，SQLite 用于流与快照行的持久化。

pub mod cache;
pub mod snapshot;
pub mod sqlite_stream;
pub mod stream;

pub use cache::{MemoryStateCache, StateCache};
pub use snapshot::{SnapshotRow, SnapshotStore, SqliteSnapshotStore, HITL_SNAPSHOT_TYPE};
pub use sqlite_stream::SqliteStreamStore;
pub use stream::{MemoryStreamStore, StreamEntry, StreamId, StreamStore};
