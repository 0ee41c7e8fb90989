//! Hive - 多租户智能体会话编排
//!
//! 入口：加载配置、初始化日志、组装存储与 Actor 运行时，启动 HITL 消费，运行到收到关闭信号。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use hive::actor::LocalActorRuntime;
use hive::agent::EchoAgentFactory;
use hive::config::load_config;
use hive::core::{
    run_until_shutdown, HiveCleanup, ShutdownCoordinator, ShutdownManager, SnapshotStoreCleanup, StreamStoreCleanup,
};
use hive::mcp::DefaultTransportFactory;
use hive::storage::{MemoryStateCache, SqliteSnapshotStore, SqliteStreamStore};
use hive::{Hive, HiveParts};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;

    for db in [&config.storage.snapshot_db, &config.storage.stream_db] {
        if let Some(dir) = db.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).context("Failed to create storage directory")?;
            }
        }
    }
    let streams = Arc::new(
        SqliteStreamStore::open(&config.storage.stream_db)
            .await
            .context("Failed to open stream store")?,
    );
    let snapshots = Arc::new(
        SqliteSnapshotStore::open(&config.storage.snapshot_db)
            .await
            .context("Failed to open snapshot store")?,
    );

    let hive = Arc::new(Hive::new(
        config.clone(),
        HiveParts {
            streams: streams.clone(),
            cache: Arc::new(MemoryStateCache::new()),
            snapshots: snapshots.clone(),
            runtime: Arc::new(LocalActorRuntime::new()),
            agents: Arc::new(EchoAgentFactory::new()),
            transports: Arc::new(DefaultTransportFactory),
        },
    ));

    let mode = hive.start().await.context("Failed to start HITL consumer")?;
    tracing::info!(app = %config.app.name, namespace = %config.app.namespace, ?mode, "Hive started");

    let manager = ShutdownManager::new();
    let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(config.actors.shutdown_grace_secs.max(1)));
    coordinator.register(HiveCleanup::new(hive.clone()));
    coordinator.register(SnapshotStoreCleanup::new(snapshots));
    coordinator.register(StreamStoreCleanup::new(streams));

    // 定期清理过期快照行
    let maintenance = {
        let hive = hive.clone();
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                if let Err(e) = hive.purge_expired().await {
                    tracing::warn!("Snapshot purge failed: {}", e);
                }
            }
        }
    };

    run_until_shutdown(&manager, maintenance, &coordinator).await;
    Ok(())
}
