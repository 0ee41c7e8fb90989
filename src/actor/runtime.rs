//! Actor 运行时抽象
//!
//! 编排层只通过 ActorRuntime（create_detached / lookup / kill / list）定位 Actor，
//! 调用走各 Actor 句柄上的 ask/tell。LocalActorRuntime 是进程内实现：
//! 命名空间内 (namespace, name) → ActorRef 的互斥表，名称冲突时报 NameTaken。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

use crate::mcp::McpServerHandle;
use crate::router::RouterHandle;
use crate::session::SessionHandle;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// 名称已被存活的 Actor 占用（调用方应重新 lookup）
    #[error("Actor name already taken: {namespace}/{name}")]
    NameTaken { namespace: String, name: String },

    #[error("Actor runtime unavailable: {0}")]
    Unavailable(String),

    #[error("Actor spawn failed: {0}")]
    SpawnFailed(String),
}

/// 已知 Actor 种类的句柄
#[derive(Clone)]
pub enum ActorRef {
    Session(SessionHandle),
    Router(RouterHandle),
    McpServer(McpServerHandle),
}

impl ActorRef {
    pub fn kind(&self) -> &'static str {
        match self {
            ActorRef::Session(_) => "session",
            ActorRef::Router(_) => "router",
            ActorRef::McpServer(_) => "mcp_server",
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            ActorRef::Session(h) => h.is_alive(),
            ActorRef::Router(h) => h.is_alive(),
            ActorRef::McpServer(h) => h.is_alive(),
        }
    }

    pub fn kill(&self) {
        match self {
            ActorRef::Session(h) => h.kill(),
            ActorRef::Router(h) => h.kill(),
            ActorRef::McpServer(h) => h.kill(),
        }
    }
}

impl std::fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ActorRef::{}(alive={})", self.kind(), self.is_alive())
    }
}

/// 创建 Actor 的闭包；只有名称可用时才会被调用
pub type Spawner = Box<dyn FnOnce() -> ActorRef + Send>;

#[async_trait]
pub trait ActorRuntime: Send + Sync {
    /// 创建命名、生命周期独立于调用方的 Actor
    async fn create_detached(&self, name: &str, namespace: &str, spawner: Spawner) -> Result<ActorRef, RuntimeError>;

    async fn lookup(&self, name: &str, namespace: &str) -> Result<Option<ActorRef>, RuntimeError>;

    /// 停止并注销；返回是否存在
    async fn kill(&self, name: &str, namespace: &str) -> Result<bool, RuntimeError>;

    /// 命名空间内存活 Actor 名称
    async fn list(&self, namespace: &str) -> Result<Vec<String>, RuntimeError>;
}

/// 进程内运行时
pub struct LocalActorRuntime {
    actors: Mutex<HashMap<(String, String), ActorRef>>,
    reachable: AtomicBool,
}

impl Default for LocalActorRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalActorRuntime {
    pub fn new() -> Self {
        Self {
            actors: Mutex::new(HashMap::new()),
            reachable: AtomicBool::new(true),
        }
    }

    /// 模拟运行时不可达（所有调用返回 Unavailable）
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), RuntimeError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RuntimeError::Unavailable("local runtime marked unreachable".to_string()))
        }
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), ActorRef>>, RuntimeError> {
        self.actors
            .lock()
            .map_err(|_| RuntimeError::Unavailable("actor table lock poisoned".to_string()))
    }
}

fn key(name: &str, namespace: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

#[async_trait]
impl ActorRuntime for LocalActorRuntime {
    async fn create_detached(&self, name: &str, namespace: &str, spawner: Spawner) -> Result<ActorRef, RuntimeError> {
        self.check()?;
        let mut table = self.table()?;
        let k = key(name, namespace);
        if let Some(existing) = table.get(&k) {
            if existing.is_alive() {
                return Err(RuntimeError::NameTaken {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }
        }
        let actor = spawner();
        tracing::info!(actor = name, namespace, kind = actor.kind(), "Detached actor created");
        table.insert(k, actor.clone());
        Ok(actor)
    }

    async fn lookup(&self, name: &str, namespace: &str) -> Result<Option<ActorRef>, RuntimeError> {
        self.check()?;
        let mut table = self.table()?;
        let k = key(name, namespace);
        match table.get(&k) {
            Some(actor) if actor.is_alive() => Ok(Some(actor.clone())),
            Some(_) => {
                table.remove(&k);
                tracing::debug!(actor = name, namespace, "Swept dead actor entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn kill(&self, name: &str, namespace: &str) -> Result<bool, RuntimeError> {
        self.check()?;
        let removed = self.table()?.remove(&key(name, namespace));
        match removed {
            Some(actor) => {
                actor.kill();
                tracing::info!(actor = name, namespace, "Actor killed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list(&self, namespace: &str) -> Result<Vec<String>, RuntimeError> {
        self.check()?;
        let table = self.table()?;
        let mut names: Vec<String> = table
            .iter()
            .filter(|((ns, _), actor)| ns == namespace && actor.is_alive())
            .map(|((_, name), _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
