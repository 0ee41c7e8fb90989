//! Actor 身份：(tenant, project, agent_mode) 唯一确定一个会话 Actor

use std::fmt;

use serde::{Deserialize, Serialize};

/// 默认智能体模式
pub const DEFAULT_AGENT_MODE: &str = "default";

/// 会话 Actor 的身份；同一身份任意时刻至多一个存活的会话 Actor
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorIdentity {
    pub tenant_id: String,
    pub project_id: String,
    pub agent_mode: String,
}

impl ActorIdentity {
    pub fn new(
        tenant_id: impl Into<String>,
        project_id: impl Into<String>,
        agent_mode: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            project_id: project_id.into(),
            agent_mode: agent_mode.into(),
        }
    }

    /// 使用默认模式
    pub fn with_default_mode(tenant_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self::new(tenant_id, project_id, DEFAULT_AGENT_MODE)
    }

    /// 全局唯一的 Actor 名称
    pub fn actor_name(&self) -> String {
        format!("agent:{}:{}:{}", self.tenant_id, self.project_id, self.agent_mode)
    }
}

impl fmt::Display for ActorIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.actor_name())
    }
}
