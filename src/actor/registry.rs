//! Actor 注册表：按身份创建 / 定位会话 Actor，维护单例，缓存运行时不可用状态
//!
//! 所有运行时交互都经过这里：出错时在冷却期内标记“不可用”，后续调用直接短路为降级路径，
//! 不在每次调用时重新探测。

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::runtime::{ActorRef, ActorRuntime, RuntimeError, Spawner};
use crate::core::HiveError;
use crate::domain::{ActorIdentity, AgentExecutionConfig};
use crate::session::{SessionActor, SessionDeps, SessionHandle};

pub struct ActorRegistry {
    runtime: Arc<dyn ActorRuntime>,
    namespace: String,
    cooldown: Duration,
    unavailable_until: Mutex<Option<Instant>>,
    sessions: Option<SessionDeps>,
}

impl ActorRegistry {
    pub fn new(runtime: Arc<dyn ActorRuntime>, namespace: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            runtime,
            namespace: namespace.into(),
            cooldown,
            unavailable_until: Mutex::new(None),
            sessions: None,
        }
    }

    /// 会话 Actor 的依赖（get_or_create 需要）
    pub fn with_session_deps(mut self, deps: SessionDeps) -> Self {
        self.sessions = Some(deps);
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 运行时是否可用（冷却期内返回 false）
    pub fn is_available(&self) -> bool {
        let Ok(mut until) = self.unavailable_until.lock() else {
            return false;
        };
        match *until {
            Some(t) if Instant::now() < t => false,
            Some(_) => {
                *until = None;
                tracing::info!(namespace = %self.namespace, "Actor substrate cooldown elapsed, probing again");
                true
            }
            None => true,
        }
    }

    fn mark_unavailable(&self, reason: &str) {
        if let Ok(mut until) = self.unavailable_until.lock() {
            *until = Some(Instant::now() + self.cooldown);
        }
        tracing::warn!(
            namespace = %self.namespace,
            cooldown_secs = self.cooldown.as_secs(),
            "Actor substrate unavailable: {}",
            reason
        );
    }

    /// 清除不可用标记
    pub fn reset_availability(&self) {
        if let Ok(mut until) = self.unavailable_until.lock() {
            *until = None;
        }
    }

    fn guard(&self) -> Result<(), HiveError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(HiveError::SubstrateUnavailable(format!(
                "namespace {} in cooldown",
                self.namespace
            )))
        }
    }

    fn runtime_failure(&self, err: RuntimeError) -> HiveError {
        self.mark_unavailable(&err.to_string());
        HiveError::SubstrateUnavailable(err.to_string())
    }

    /// 按名称查找（任何运行时错误都会触发冷却）
    pub async fn lookup(&self, name: &str) -> Result<Option<ActorRef>, HiveError> {
        self.guard()?;
        self.runtime
            .lookup(name, &self.namespace)
            .await
            .map_err(|e| self.runtime_failure(e))
    }

    /// 创建或定位：名称冲突时重新 lookup；返回 (句柄, 是否新建)
    pub async fn ensure_singleton(&self, name: &str, spawner: Spawner) -> Result<(ActorRef, bool), HiveError> {
        if let Some(existing) = self.lookup(name).await? {
            return Ok((existing, false));
        }
        match self.runtime.create_detached(name, &self.namespace, spawner).await {
            Ok(actor) => Ok((actor, true)),
            Err(RuntimeError::NameTaken { .. }) => {
                tracing::debug!(actor = name, "Lost create race, re-looking up");
                match self.lookup(name).await? {
                    Some(actor) => Ok((actor, false)),
                    None => Err(HiveError::ActorStopped(name.to_string())),
                }
            }
            Err(e) => Err(self.runtime_failure(e)),
        }
    }

    /// 停止并注销
    pub async fn kill(&self, name: &str) -> Result<bool, HiveError> {
        self.guard()?;
        self.runtime
            .kill(name, &self.namespace)
            .await
            .map_err(|e| self.runtime_failure(e))
    }

    pub async fn list(&self) -> Result<Vec<String>, HiveError> {
        self.guard()?;
        self.runtime
            .list(&self.namespace)
            .await
            .map_err(|e| self.runtime_failure(e))
    }

    /// 获取或创建会话 Actor；新建（或并发竞争落败）时调用 initialize(config, false)
    pub async fn get_or_create(
        &self,
        identity: &ActorIdentity,
        config: &AgentExecutionConfig,
    ) -> Result<SessionHandle, HiveError> {
        let deps = self
            .sessions
            .clone()
            .ok_or_else(|| HiveError::Config("session dependencies not configured".to_string()))?;
        let name = identity.actor_name();

        let spawn_identity = identity.clone();
        let spawner: Spawner = Box::new(move || ActorRef::Session(SessionActor::spawn(spawn_identity, deps)));
        let (actor, created) = self.ensure_singleton(&name, spawner).await?;

        let kind = actor.kind();
        let ActorRef::Session(handle) = actor else {
            return Err(HiveError::InvalidPayload(format!(
                "{} is registered as a {} actor",
                name, kind
            )));
        };

        if created {
            tracing::info!(actor = %name, "Session actor created");
        }
        let outcome = handle.initialize(config.clone(), false).await?;
        tracing::debug!(actor = %name, cached = outcome.cached, "Session actor ready");
        Ok(handle)
    }

    /// 非创建式查找；运行时出错时返回 None
    pub async fn get_if_exists(&self, identity: &ActorIdentity) -> Option<SessionHandle> {
        match self.lookup(&identity.actor_name()).await {
            Ok(Some(ActorRef::Session(handle))) => Some(handle),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(actor = %identity, "Session lookup skipped: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::LocalActorRuntime;

    #[tokio::test]
    async fn test_unavailable_runtime_enters_cooldown() {
        let runtime = Arc::new(LocalActorRuntime::new());
        let registry = ActorRegistry::new(runtime.clone(), "hive", Duration::from_millis(80));
        runtime.set_reachable(false);

        assert!(matches!(
            registry.lookup("agent:t:p:default").await,
            Err(HiveError::SubstrateUnavailable(_))
        ));
        assert!(!registry.is_available());

        runtime.set_reachable(true);
        assert!(registry.lookup("agent:t:p:default").await.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.lookup("agent:t:p:default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_or_create_without_deps_is_config_error() {
        let registry = ActorRegistry::new(Arc::new(LocalActorRuntime::new()), "hive", Duration::from_secs(1));
        let id = ActorIdentity::with_default_mode("t", "p");
        assert!(matches!(
            registry.get_or_create(&id, &AgentExecutionConfig::default()).await,
            Err(HiveError::Config(_))
        ));
    }
}
