//! 领域类型：Actor 身份、执行配置、对话请求/结果、消息与 HITL 状态
//!
//! 所有跨进程边界的负载（HITL 响应、通道消息）在解码时即校验为带标签的枚举，
//! 内部不再传递松散的 JSON map。

pub mod agent_config;
pub mod chat;
pub mod hitl;
pub mod identity;
pub mod message;

pub use agent_config::AgentExecutionConfig;
pub use chat::{ChatOverrides, ChatRequest, ChatResult};
pub use hitl::{HitlAgentState, HitlResponse, HitlResponseMessage, HitlType};
pub use identity::ActorIdentity;
pub use message::{Message, Role};
