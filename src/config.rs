//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__HITL__LOOKUP_RETRIES=5`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::actor::MailboxConfig;
use crate::domain::AgentExecutionConfig;
use crate::hitl::HitlStoreSettings;
use crate::router::ConsumerSettings;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct HiveConfig {
    pub app: AppSection,
    /// 会话 Actor 的默认执行配置（路由按需创建会话时使用）
    pub agent: AgentExecutionConfig,
    pub actors: ActorsSection,
    pub hitl: HitlSection,
    pub mcp: McpSection,
    pub storage: StorageSection,
}

/// [app] 段：应用名与 Actor 命名空间
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: String,
    pub namespace: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: "hive".to_string(),
            namespace: "hive".to_string(),
        }
    }
}

/// [actors] 段：运行时不可用冷却、邮箱容量、重启预算、调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ActorsSection {
    pub unavailable_cooldown_secs: u64,
    pub mailbox_capacity: usize,
    pub max_restarts: u32,
    /// 0 表示不限
    pub invoke_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for ActorsSection {
    fn default() -> Self {
        Self {
            unavailable_cooldown_secs: 30,
            mailbox_capacity: 256,
            max_restarts: 3,
            invoke_timeout_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

impl ActorsSection {
    pub fn mailbox(&self) -> MailboxConfig {
        MailboxConfig {
            capacity: self.mailbox_capacity,
            max_restarts: self.max_restarts,
            invoke_timeout: (self.invoke_timeout_secs > 0).then(|| Duration::from_secs(self.invoke_timeout_secs)),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.unavailable_cooldown_secs)
    }
}

/// [hitl] 段：状态 TTL、查找重试、响应通道消费组
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HitlSection {
    pub ttl_margin_secs: u64,
    pub lookup_retries: u32,
    pub retry_delay_ms: u64,
    pub consumer_group: String,
    /// 未设置时为 `consumer-{pid}`
    pub consumer_name: Option<String>,
    pub block_ms: u64,
    pub batch_size: usize,
    pub claim_idle_ms: u64,
    pub default_timeout_secs: u64,
    pub running_marker_ttl_secs: u64,
}

impl Default for HitlSection {
    fn default() -> Self {
        Self {
            ttl_margin_secs: 60,
            lookup_retries: 3,
            retry_delay_ms: 100,
            consumer_group: "hitl-router".to_string(),
            consumer_name: None,
            block_ms: 1000,
            batch_size: 10,
            claim_idle_ms: 30_000,
            default_timeout_secs: 300,
            running_marker_ttl_secs: 3600,
        }
    }
}

impl HitlSection {
    pub fn store_settings(&self) -> HitlStoreSettings {
        HitlStoreSettings {
            ttl_margin: Duration::from_secs(self.ttl_margin_secs),
            lookup_retries: self.lookup_retries,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        let defaults = ConsumerSettings::default();
        ConsumerSettings {
            group: self.consumer_group.clone(),
            consumer: self.consumer_name.clone().unwrap_or(defaults.consumer),
            batch_size: self.batch_size,
            block: Duration::from_millis(self.block_ms),
            claim_idle: Duration::from_millis(self.claim_idle_ms),
        }
    }
}

/// [mcp] 段：连接 / 调用 / 探活超时与重连预算
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct McpSection {
    pub connect_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            call_timeout_secs: 60,
            probe_timeout_secs: 5,
            max_reconnect_attempts: 3,
        }
    }
}

/// [storage] 段：快照行的 SQLite 路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub snapshot_db: PathBuf,
    /// 事件日志与 HITL 响应通道的 SQLite 文件
    pub stream_db: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            snapshot_db: PathBuf::from("data/hive_snapshots.db"),
            stream_db: PathBuf::from("data/hive_streams.db"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<HiveConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: HiveConfig = config::Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(config.app.namespace, "hive");
        assert_eq!(config.hitl.lookup_retries, 3);
        assert_eq!(config.actors.mailbox().invoke_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_explicit_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[hitl]\nlookup_retries = 5\nconsumer_group = \"g1\"\n\n[actors]\ninvoke_timeout_secs = 0\n\n[agent]\nmax_steps = 7"
        )
        .unwrap();
        let config = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.hitl.lookup_retries, 5);
        assert_eq!(config.hitl.consumer_settings().group, "g1");
        assert_eq!(config.actors.mailbox().invoke_timeout, None);
        assert_eq!(config.agent.max_steps, 7);
        assert_eq!(config.agent.temperature, 0.7);
    }
}
