//! MCP 工具服务器连接
//!
//! - **protocol**: JSON-RPC 2.0 消息与 MCP 方法
//! - **transport**: stdio / HTTP / WebSocket 三种传输，统一契约
//! - **server_actor**: 单服务器连接 Actor（有界自动重连、健康检查）
//! - **manager**: 每租户连接管理器与租户目录
//! - **classify**: 工具错误分类

pub mod classify;
pub mod error;
pub mod manager;
pub mod mock;
pub mod protocol;
pub mod server_actor;
pub mod transport;
pub mod types;

pub use classify::{classify_tool_error, ToolErrorCategory, ToolErrorClass};
pub use error::McpError;
pub use manager::{ConnectionManager, McpDirectory, McpSettings};
pub use mock::MockTransportFactory;
pub use protocol::{result_text, McpToolDefinition, ServerInfo};
pub use server_actor::{McpServerActor, McpServerHandle};
pub use transport::{DefaultTransportFactory, McpTransport, TransportFactory};
pub use types::{server_actor_name, HealthReport, ServerConnectionConfig, ServerConnectionStatus, TransportKind};
