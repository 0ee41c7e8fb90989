//! Hive 错误类型
//!
//! HiveError 为跨模块的统一错误；StoreError 由各存储后端返回，经 `?` 自动转换。
//! Actor 运行时与 MCP 传输各有独立错误枚举（见 actor::runtime / mcp::error）。

use thiserror::Error;

use crate::mcp::McpError;

/// 存储后端错误（流存储 / 快速存储 / 关系型快照）
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 记录格式不符合写入要求（如带序号追加的负载不是对象）
    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// 编排层错误：Actor 不可用、会话状态不符、HITL 状态缺失、负载非法等
#[derive(Error, Debug)]
pub enum HiveError {
    /// Actor 运行时不可达，调用方应降级为本地执行
    #[error("Actor substrate unavailable: {0}")]
    SubstrateUnavailable(String),

    /// Actor 邮箱已关闭（已停止或已被 kill）
    #[error("Actor stopped: {0}")]
    ActorStopped(String),

    #[error("Actor invocation timed out: {0}")]
    InvokeTimeout(String),

    #[error("Session not initialized: {0}")]
    NotInitialized(String),

    /// 会话处于 ERROR 状态，需重新 initialize
    #[error("Session failed: {0}")]
    SessionFailed(String),

    #[error("Agent creation failed: {0}")]
    AgentInit(String),

    #[error("HITL state not found or expired: {0}")]
    HitlStateNotFound(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("MCP server not found: {0}")]
    McpServerNotFound(String),

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    Config(String),
}

impl HiveError {
    /// 是否属于基础设施暂时不可用（可降级 / 可重投递）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HiveError::SubstrateUnavailable(_)
                | HiveError::ActorStopped(_)
                | HiveError::InvokeTimeout(_)
                | HiveError::Store(StoreError::Unavailable(_))
        )
    }
}

impl From<serde_json::Error> for HiveError {
    fn from(err: serde_json::Error) -> Self {
        HiveError::InvalidPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(HiveError::SubstrateUnavailable("down".into()).is_transient());
        assert!(HiveError::Store(StoreError::Unavailable("redis".into())).is_transient());
        assert!(!HiveError::HitlStateNotFound("req_1".into()).is_transient());
        assert!(!HiveError::NotInitialized("agent:t:p:default".into()).is_transient());
    }

    #[test]
    fn test_store_error_converts() {
        let err: HiveError = StoreError::Unavailable("gone".into()).into();
        assert!(err.to_string().contains("gone"));
    }
}
