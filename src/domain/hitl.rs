//! HITL（Human-In-The-Loop）领域类型
//!
//! - HitlAgentState：暂停时持久化的完整执行上下文，恢复成功后删除且仅删除一次
//! - HitlResponse：按请求类型校验后的人类响应，决定合成的 tool 结果文本
//! - HitlResponseMessage：响应通道上的消息负载

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::identity::{ActorIdentity, DEFAULT_AGENT_MODE};
use super::message::Message;
use crate::core::HiveError;

/// HITL 请求类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HitlType {
    Clarification,
    Decision,
    EnvVar,
    Permission,
}

impl HitlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitlType::Clarification => "clarification",
            HitlType::Decision => "decision",
            HitlType::EnvVar => "env_var",
            HitlType::Permission => "permission",
        }
    }
}

impl fmt::Display for HitlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 暂停时持久化的执行状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlAgentState {
    pub conversation_id: String,
    pub message_id: String,
    pub tenant_id: String,
    pub project_id: String,
    #[serde(default = "default_agent_mode")]
    pub agent_mode: String,
    pub hitl_request_id: String,
    pub hitl_type: HitlType,
    pub request_data: Value,
    /// 暂停时刻的上下文快照
    pub messages: Vec<Message>,
    pub user_message: String,
    pub user_id: String,
    pub correlation_id: Option<String>,
    pub step_count: usize,
    pub timeout_seconds: u64,
    pub pending_tool_call_id: Option<String>,
    /// 暂停前最后一个已持久化事件的序号
    pub last_sequence_number: u64,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
}

fn default_agent_mode() -> String {
    DEFAULT_AGENT_MODE.to_string()
}

impl HitlAgentState {
    pub fn identity(&self) -> ActorIdentity {
        ActorIdentity::new(&self.tenant_id, &self.project_id, &self.agent_mode)
    }
}

/// 校验后的人类响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HitlResponse {
    ClarificationText(String),
    ClarificationSelected(Vec<String>),
    DecisionCustom(String),
    DecisionChosen(String),
    /// 仅保留变量名，值永远不进入上下文
    EnvVars(Vec<String>),
    PermissionGranted { scope: String },
    PermissionDenied,
    /// 取消或超时
    Incomplete(HitlType),
    /// 既无选择也无取消信息
    Unspecified(HitlType),
}

impl HitlResponse {
    /// 按请求类型解析响应数据
    ///
    /// 接受的形状：
    /// - 任意类型：`{"cancelled": true}` / `{"timed_out": true}` / `{"status": "cancelled" | "timeout"}`
    /// - clarification：`custom_input` / `text` 为自由文本；`selected_options` / `selected_option` / `answer` 为选项（字符串或数组）；纯字符串视为自由文本
    /// - decision：`custom_input` 为自定义；`decision` / `selected_option` / `answer` 为所选项；纯字符串视为所选项
    /// - env_var：`values` / `variables` 对象的键，或 `provided` 名称数组
    /// - permission：`granted` / `approved` 布尔或 `action`（allow/deny），`scope` 默认 once；纯字符串视为 action
    pub fn from_response_data(hitl_type: HitlType, data: &Value) -> Self {
        if is_incomplete(data) {
            return HitlResponse::Incomplete(hitl_type);
        }

        match hitl_type {
            HitlType::Clarification => parse_clarification(data),
            HitlType::Decision => parse_decision(data),
            HitlType::EnvVar => parse_env_var(data),
            HitlType::Permission => parse_permission(data),
        }
    }

    /// 合成的 tool 结果文本
    pub fn to_tool_result(&self) -> String {
        match self {
            HitlResponse::ClarificationText(text) => format!("User clarification: {}", text),
            HitlResponse::ClarificationSelected(options) => {
                format!("User selected: {}", options.join(", "))
            }
            HitlResponse::DecisionCustom(text) => format!("User decision (custom): {}", text),
            HitlResponse::DecisionChosen(option) => format!("User chose: {}", option),
            HitlResponse::EnvVars(names) => {
                format!("User provided environment variables: {}", names.join(", "))
            }
            HitlResponse::PermissionGranted { scope } => {
                format!("User granted permission (scope: {})", scope)
            }
            HitlResponse::PermissionDenied => "User denied permission".to_string(),
            HitlResponse::Incomplete(t) => format!("User did not complete {} request", t),
            HitlResponse::Unspecified(t) => format!("User responded to {} request", t),
        }
    }
}

fn is_incomplete(data: &Value) -> bool {
    let Some(obj) = data.as_object() else {
        return matches!(data.as_str(), Some("cancelled" | "timeout" | "timed_out"));
    };
    let flag = |key: &str| obj.get(key).and_then(Value::as_bool).unwrap_or(false);
    if flag("cancelled") || flag("timed_out") || flag("timeout") {
        return true;
    }
    matches!(
        obj.get("status").and_then(Value::as_str),
        Some("cancelled" | "timeout" | "timed_out")
    )
}

fn non_empty_str(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// 字符串或字符串数组
fn string_list(v: Option<&Value>) -> Vec<String> {
    match v {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| match i {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_clarification(data: &Value) -> HitlResponse {
    if let Some(text) = data.as_str().map(str::trim).filter(|s| !s.is_empty()) {
        return HitlResponse::ClarificationText(text.to_string());
    }
    let Some(obj) = data.as_object() else {
        return HitlResponse::Unspecified(HitlType::Clarification);
    };
    if let Some(text) = non_empty_str(obj.get("custom_input")).or_else(|| non_empty_str(obj.get("text"))) {
        return HitlResponse::ClarificationText(text);
    }
    for key in ["selected_options", "selected_option", "answer"] {
        let selected = string_list(obj.get(key));
        if !selected.is_empty() {
            return HitlResponse::ClarificationSelected(selected);
        }
    }
    HitlResponse::Unspecified(HitlType::Clarification)
}

fn parse_decision(data: &Value) -> HitlResponse {
    if let Some(choice) = data.as_str().map(str::trim).filter(|s| !s.is_empty()) {
        return HitlResponse::DecisionChosen(choice.to_string());
    }
    let Some(obj) = data.as_object() else {
        return HitlResponse::Unspecified(HitlType::Decision);
    };
    if let Some(text) = non_empty_str(obj.get("custom_input")) {
        return HitlResponse::DecisionCustom(text);
    }
    for key in ["decision", "selected_option", "answer"] {
        if let Some(choice) = non_empty_str(obj.get(key)) {
            return HitlResponse::DecisionChosen(choice);
        }
    }
    HitlResponse::Unspecified(HitlType::Decision)
}

fn parse_env_var(data: &Value) -> HitlResponse {
    let Some(obj) = data.as_object() else {
        return HitlResponse::Unspecified(HitlType::EnvVar);
    };
    let mut names: Vec<String> = ["values", "variables"]
        .iter()
        .filter_map(|key| obj.get(*key).and_then(Value::as_object))
        .flat_map(|vars| vars.keys().cloned())
        .collect();
    if names.is_empty() {
        names = string_list(obj.get("provided"));
    }
    names.sort();
    names.dedup();
    if names.is_empty() {
        HitlResponse::Unspecified(HitlType::EnvVar)
    } else {
        HitlResponse::EnvVars(names)
    }
}

fn parse_permission(data: &Value) -> HitlResponse {
    let (granted, scope) = match data {
        Value::String(action) => (action_grants(action), None),
        Value::Object(obj) => {
            let granted = obj
                .get("granted")
                .or_else(|| obj.get("approved"))
                .and_then(Value::as_bool)
                .or_else(|| obj.get("action").and_then(Value::as_str).and_then(action_grants));
            (granted, non_empty_str(obj.get("scope")))
        }
        _ => (None, None),
    };
    match granted {
        Some(true) => HitlResponse::PermissionGranted {
            scope: scope.unwrap_or_else(|| "once".to_string()),
        },
        Some(false) => HitlResponse::PermissionDenied,
        None => HitlResponse::Unspecified(HitlType::Permission),
    }
}

fn action_grants(action: &str) -> Option<bool> {
    match action.trim().to_ascii_lowercase().as_str() {
        "allow" | "grant" | "granted" | "approve" | "approved" | "yes" => Some(true),
        "deny" | "denied" | "reject" | "rejected" | "no" => Some(false),
        _ => None,
    }
}

/// 响应通道上的消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HitlResponseMessage {
    pub request_id: String,
    pub response_data: Value,
    pub tenant_id: String,
    pub project_id: String,
    pub conversation_id: String,
    #[serde(default = "default_agent_mode")]
    pub agent_mode: String,
}

impl HitlResponseMessage {
    /// 从通道负载解码并校验；response_data 若为 JSON 编码的字符串则展开
    pub fn decode(payload: &Value) -> Result<Self, HiveError> {
        let mut msg: HitlResponseMessage = serde_json::from_value(payload.clone())?;
        for (field, value) in [
            ("request_id", &msg.request_id),
            ("tenant_id", &msg.tenant_id),
            ("project_id", &msg.project_id),
        ] {
            if value.trim().is_empty() {
                return Err(HiveError::InvalidPayload(format!("{} must not be empty", field)));
            }
        }
        if msg.agent_mode.trim().is_empty() {
            msg.agent_mode = default_agent_mode();
        }
        if let Value::String(raw) = &msg.response_data {
            if raw.trim_start().starts_with('{') {
                if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
                    msg.response_data = parsed;
                }
            }
        }
        Ok(msg)
    }

    pub fn identity(&self) -> ActorIdentity {
        ActorIdentity::new(&self.tenant_id, &self.project_id, &self.agent_mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn describe(t: HitlType, data: Value) -> String {
        HitlResponse::from_response_data(t, &data).to_tool_result()
    }

    #[test]
    fn test_clarification_formats() {
        assert_eq!(describe(HitlType::Clarification, json!({"answer": "A"})), "User selected: A");
        assert_eq!(
            describe(HitlType::Clarification, json!({"selected_options": ["A", "B"]})),
            "User selected: A, B"
        );
        assert_eq!(
            describe(HitlType::Clarification, json!({"custom_input": "use staging"})),
            "User clarification: use staging"
        );
        assert_eq!(
            describe(HitlType::Clarification, json!("free text")),
            "User clarification: free text"
        );
        assert_eq!(
            describe(HitlType::Clarification, json!({})),
            "User responded to clarification request"
        );
    }

    #[test]
    fn test_decision_formats() {
        assert_eq!(describe(HitlType::Decision, json!({"decision": "deploy"})), "User chose: deploy");
        assert_eq!(
            describe(HitlType::Decision, json!({"custom_input": "wait a day"})),
            "User decision (custom): wait a day"
        );
    }

    #[test]
    fn test_env_var_never_leaks_values() {
        let text = describe(
            HitlType::EnvVar,
            json!({"values": {"OPENAI_API_KEY": "sk-secret", "DB_URL": "postgres://x"}}),
        );
        assert_eq!(text, "User provided environment variables: DB_URL, OPENAI_API_KEY");
        assert!(!text.contains("sk-secret"));
    }

    #[test]
    fn test_permission_formats() {
        assert_eq!(
            describe(HitlType::Permission, json!({"granted": true, "scope": "session"})),
            "User granted permission (scope: session)"
        );
        assert_eq!(
            describe(HitlType::Permission, json!({"granted": true})),
            "User granted permission (scope: once)"
        );
        assert_eq!(describe(HitlType::Permission, json!({"action": "deny"})), "User denied permission");
    }

    #[test]
    fn test_cancelled_or_timeout_for_any_type() {
        assert_eq!(
            describe(HitlType::Decision, json!({"cancelled": true, "decision": "x"})),
            "User did not complete decision request"
        );
        assert_eq!(
            describe(HitlType::EnvVar, json!({"status": "timeout"})),
            "User did not complete env_var request"
        );
    }

    #[test]
    fn test_decode_response_message() {
        let payload = json!({
            "request_id": "req_1",
            "response_data": "{\"answer\": \"A\"}",
            "tenant_id": "t1",
            "project_id": "p1",
            "conversation_id": "c1"
        });
        let msg = HitlResponseMessage::decode(&payload).unwrap();
        assert_eq!(msg.agent_mode, "default");
        assert_eq!(msg.response_data, json!({"answer": "A"}));
        assert_eq!(msg.identity().actor_name(), "agent:t1:p1:default");

        let bad = json!({"request_id": "", "response_data": {}, "tenant_id": "t", "project_id": "p", "conversation_id": "c"});
        assert!(HitlResponseMessage::decode(&bad).is_err());
    }
}
