//! 工具错误分类
//!
//! 按错误消息模式归类（连接 / 超时 / 参数 / 权限 / 不存在 / 资源），每类带可重试标记与最大重试次数。
//! 分类感知耗时：实际耗时远小于配置超时时，消息里的 "timeout" 字样不算真正超时，归为不可重试的执行错误。

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCategory {
    Connection,
    Timeout,
    Parameter,
    Permission,
    NotFound,
    Resource,
    Execution,
}

impl ToolErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolErrorCategory::Connection | ToolErrorCategory::Timeout | ToolErrorCategory::Resource
        )
    }

    pub fn max_retries(&self) -> u32 {
        match self {
            ToolErrorCategory::Connection => 3,
            ToolErrorCategory::Timeout => 2,
            ToolErrorCategory::Resource => 2,
            _ => 0,
        }
    }
}

/// 分类结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolErrorClass {
    pub category: ToolErrorCategory,
    pub retryable: bool,
    pub max_retries: u32,
    pub message: String,
}

/// 低于该比例的耗时不认为是真正超时
const TIMEOUT_ELAPSED_RATIO: f64 = 0.5;

fn patterns() -> &'static [(ToolErrorCategory, Regex)] {
    static PATTERNS: OnceLock<Vec<(ToolErrorCategory, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (
                ToolErrorCategory::Timeout,
                r"(?i)timed?\s*out|timeout|deadline exceeded",
            ),
            (
                ToolErrorCategory::Connection,
                r"(?i)connection (refused|reset|closed|failed)|broken pipe|not connected|closed (stdout|the socket)|stream ended|econnrefused|dns|unreachable",
            ),
            (
                ToolErrorCategory::Permission,
                r"(?i)permission denied|forbidden|unauthori[sz]ed|access denied|\b40[13]\b",
            ),
            (
                ToolErrorCategory::NotFound,
                r"(?i)not found|no such (file|tool|method)|unknown tool|method not found|\b404\b|-32601",
            ),
            (
                ToolErrorCategory::Parameter,
                r"(?i)invalid (param|argument|input)|missing (required )?(param|argument|field)|validation|-32602|bad request|\b400\b",
            ),
            (
                ToolErrorCategory::Resource,
                r"(?i)rate limit|too many requests|quota|out of memory|resource exhausted|\b429\b|\b503\b",
            ),
        ]
        .into_iter()
        .filter_map(|(category, pattern)| Regex::new(pattern).ok().map(|re| (category, re)))
        .collect()
    })
}

/// 分类工具错误
///
/// `elapsed` / `timeout` 为本次调用的实际耗时与配置超时；任一缺失时不做耗时修正。
pub fn classify_tool_error(message: &str, elapsed: Option<Duration>, timeout: Option<Duration>) -> ToolErrorClass {
    let mut category = patterns()
        .iter()
        .find(|(_, re)| re.is_match(message))
        .map(|(c, _)| *c)
        .unwrap_or(ToolErrorCategory::Execution);

    if category == ToolErrorCategory::Timeout {
        if let (Some(elapsed), Some(timeout)) = (elapsed, timeout) {
            if elapsed.as_secs_f64() < timeout.as_secs_f64() * TIMEOUT_ELAPSED_RATIO {
                category = ToolErrorCategory::Execution;
            }
        }
    }

    ToolErrorClass {
        category,
        retryable: category.is_retryable(),
        max_retries: category.max_retries(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let c = classify_tool_error("Connection refused (os error 111)", None, None);
        assert_eq!(c.category, ToolErrorCategory::Connection);
        assert!(c.retryable);

        let p = classify_tool_error("RPC error -32602: invalid params", None, None);
        assert_eq!(p.category, ToolErrorCategory::Parameter);
        assert!(!p.retryable);

        assert_eq!(
            classify_tool_error("permission denied: /etc/shadow", None, None).category,
            ToolErrorCategory::Permission
        );
        assert_eq!(
            classify_tool_error("Unknown tool: frobnicate", None, None).category,
            ToolErrorCategory::NotFound
        );
        assert_eq!(
            classify_tool_error("429 Too Many Requests", None, None).category,
            ToolErrorCategory::Resource
        );
        assert_eq!(
            classify_tool_error("division by zero", None, None).category,
            ToolErrorCategory::Execution
        );
    }

    #[test]
    fn test_fast_timeout_text_is_execution_error() {
        let timeout = Some(Duration::from_secs(60));
        let fast = classify_tool_error("query failed: lock timeout", Some(Duration::from_millis(200)), timeout);
        assert_eq!(fast.category, ToolErrorCategory::Execution);
        assert!(!fast.retryable);

        let slow = classify_tool_error("request timed out", Some(Duration::from_secs(59)), timeout);
        assert_eq!(slow.category, ToolErrorCategory::Timeout);
        assert_eq!(slow.max_retries, 2);
    }
}
