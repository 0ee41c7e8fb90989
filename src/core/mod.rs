//! 核心：错误类型、后台任务表、优雅关闭

pub mod error;
pub mod shutdown;
pub mod task_tracker;

pub use error::{HiveError, StoreError};
pub use shutdown::{
    run_until_shutdown, CleanupOutcome, HiveCleanup, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason, SnapshotStoreCleanup, StreamStoreCleanup,
};
pub use task_tracker::{TaskKind, TaskSummary, TaskTracker};
