//! 智能体执行配置：由启动会话的一方持有，按值传入 initialize

use serde::{Deserialize, Serialize};

/// 不可变的执行配置记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentExecutionConfig {
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// 单轮最大推理步数
    pub max_steps: usize,
    /// 工具并发上限
    pub max_concurrent_tools: usize,
    /// 工具列表缓存 TTL（秒）
    pub tool_cache_ttl_secs: u64,
    pub enable_skills: bool,
    pub enable_mcp: bool,
    pub enable_plan_mode: bool,
}

impl Default for AgentExecutionConfig {
    fn default() -> Self {
        Self {
            model: "deepseek-chat".to_string(),
            api_key: None,
            base_url: None,
            temperature: 0.7,
            max_tokens: 4096,
            max_steps: 20,
            max_concurrent_tools: 3,
            tool_cache_ttl_secs: 300,
            enable_skills: true,
            enable_mcp: true,
            enable_plan_mode: false,
        }
    }
}
