//! Hive - Rust 多租户智能体会话编排
//!
//! 模块划分：
//! - **actor**: 邮箱、Actor 运行时抽象（本地实现）与注册表
//! - **agent**: 智能体接口与 Mock 实现（推理循环本身在外部）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、后台任务表、优雅关闭
//! - **domain**: 身份、执行配置、对话请求/结果、HITL 状态
//! - **execution**: 事件日志与执行协调器（HITL 暂停 / 恢复）
//! - **hitl**: HITL 状态双写存储
//! - **hive**: 组装各组件的门面
//! - **mcp**: MCP 工具服务器连接（stdio / HTTP / WebSocket）
//! - **observability**: 日志初始化
//! - **router**: HITL 响应路由与本地降级消费者
//! - **session**: 会话 Actor
//! - **storage**: 流存储、快速存储、关系型快照

pub mod actor;
pub mod agent;
pub mod config;
pub mod core;
pub mod domain;
pub mod execution;
pub mod hitl;
pub mod hive;
pub mod mcp;
pub mod observability;
pub mod router;
pub mod session;
pub mod storage;

pub use hive::{ConsumerMode, Hive, HiveParts};
