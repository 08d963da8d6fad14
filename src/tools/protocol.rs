//! 工具调用协议：请求结构、后端连接 trait、响应归一化
//!
//! 外部后端可能返回多种形状（`{content}`、`{result: {content}}`、`{error_code, message}`、
//! `{error}`、`{isError, content}`、裸字符串），统一归一化为 ResultEnvelope；
//! 无法识别的形状一律记为 malformed_response，不抛错。

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::task::ResultEnvelope;

/// 本地分类错误码（写入 ResultEnvelope.error.code）
pub mod codes {
    pub const TIMEOUT: &str = "timeout";
    pub const RESOLUTION_ERROR: &str = "resolution_error";
    pub const MALFORMED_RESPONSE: &str = "malformed_response";
    pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";
    pub const TRANSPORT_ERROR: &str = "transport_error";
    pub const BACKEND_ERROR: &str = "backend_error";
}

/// 发往后端的一次调用请求（stdio 后端按一行 JSON 发送）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ToolRequest {
    /// 后端内的工具 ID（路由解析后的规范名）
    pub tool_id: String,
    /// 调用参数
    #[serde(default)]
    pub arguments: Map<String, Value>,
    /// 关联 ID：响应必须原样带回
    pub correlation_id: String,
    /// 剩余截止时间（毫秒）
    pub deadline_ms: u64,
}

/// 后端连接：对一个已启动后端发起调用，返回原始响应
#[async_trait]
pub trait Backend: Send + Sync {
    async fn call(&self, request: ToolRequest) -> Result<Value, String>;

    /// 重启钩子（内置后端用于清理内部状态）
    async fn reset(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 将后端原始响应归一化为 ResultEnvelope
pub fn normalize_response(raw: Value) -> ResultEnvelope {
    match raw {
        Value::String(text) => ResultEnvelope::success(Value::String(text)),
        Value::Object(map) => normalize_object(map),
        other => ResultEnvelope::failure(
            codes::MALFORMED_RESPONSE,
            format!("unsupported response shape: {}", preview(&other)),
        ),
    }
}

fn normalize_object(mut map: Map<String, Value>) -> ResultEnvelope {
    if let Some(code) = map.get("error_code").filter(|v| !v.is_null()) {
        let code = scalar_to_string(code);
        let message = map
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("backend reported an error")
            .to_string();
        return ResultEnvelope::failure(code, message);
    }

    if let Some(err) = map.remove("error").filter(|v| !v.is_null()) {
        return match err {
            Value::String(message) => ResultEnvelope::failure(codes::BACKEND_ERROR, message),
            Value::Object(obj) => {
                let code = obj
                    .get("code")
                    .filter(|v| !v.is_null())
                    .map(scalar_to_string)
                    .unwrap_or_else(|| codes::BACKEND_ERROR.to_string());
                let message = obj
                    .get("message")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| Value::Object(obj.clone()).to_string());
                ResultEnvelope::failure(code, message)
            }
            other => ResultEnvelope::failure(codes::BACKEND_ERROR, other.to_string()),
        };
    }

    if map.get("isError").and_then(|v| v.as_bool()) == Some(true) {
        let message = map
            .get("content")
            .map(render_content)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "backend flagged the call as failed".to_string());
        return ResultEnvelope::failure(codes::BACKEND_ERROR, message);
    }

    if let Some(content) = map.remove("content") {
        return ResultEnvelope::success(content);
    }

    match map.remove("result") {
        Some(Value::Object(mut result)) => match result.remove("content") {
            Some(content) => ResultEnvelope::success(content),
            None => ResultEnvelope::success(Value::Object(result)),
        },
        Some(Value::Null) | None => ResultEnvelope::failure(
            codes::MALFORMED_RESPONSE,
            "response has neither content nor error",
        ),
        Some(other) => ResultEnvelope::success(other),
    }
}

/// content 数组（`[{type:"text", text}]`）拼成文本
fn render_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(obj) => obj.get("text").and_then(|t| t.as_str()).map(str::to_string),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn preview(v: &Value) -> String {
    let s = v.to_string();
    if s.chars().count() > 80 {
        format!("{}...", s.chars().take(80).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_accepts_all_known_success_shapes() {
        let flat = normalize_response(json!({"content": ["a/", "b/"]}));
        assert!(flat.ok);
        assert_eq!(flat.content, json!(["a/", "b/"]));

        let nested = normalize_response(json!({"result": {"content": "hello"}}));
        assert!(nested.ok);
        assert_eq!(nested.content, json!("hello"));

        let bare = normalize_response(json!("plain text"));
        assert!(bare.ok);
        assert_eq!(bare.content, json!("plain text"));

        let mcp = normalize_response(json!({"isError": false, "content": [{"type": "text", "text": "x"}]}));
        assert!(mcp.ok);
    }

    #[test]
    fn test_accepts_all_known_error_shapes() {
        let coded = normalize_response(json!({"error_code": "ENOENT", "message": "missing"}));
        assert!(!coded.ok);
        let err = coded.error.unwrap();
        assert_eq!(err.code, "ENOENT");
        assert_eq!(err.message, "missing");

        let nested = normalize_response(json!({"error": {"code": -32601, "message": "no method"}}));
        assert_eq!(nested.error.unwrap().code, "-32601");

        let plain = normalize_response(json!({"error": "exploded"}));
        let err = plain.error.unwrap();
        assert_eq!(err.code, codes::BACKEND_ERROR);
        assert_eq!(err.message, "exploded");

        let flagged = normalize_response(json!({"isError": true, "content": [{"type": "text", "text": "denied"}]}));
        assert!(!flagged.ok);
        assert_eq!(flagged.error.unwrap().message, "denied");
    }

    #[test]
    fn test_unknown_shapes_are_malformed() {
        for raw in [json!(42), json!(null), json!([1, 2]), json!({"foo": 1}), json!({"result": null})] {
            let env = normalize_response(raw);
            assert!(!env.ok);
            assert_eq!(env.error.unwrap().code, codes::MALFORMED_RESPONSE);
        }
    }

    #[test]
    fn test_null_error_field_is_ignored() {
        let env = normalize_response(json!({"error": null, "content": "ok"}));
        assert!(env.ok);
    }
}
