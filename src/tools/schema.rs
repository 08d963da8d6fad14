//! 协议 JSON Schema 生成（schemars）
//!
//! 规划提示词中附带「合法调用」的结构，减少 LLM 输出格式错误；
//! 也作为 stdio 后端的请求格式说明。

use schemars::{schema_for, JsonSchema};
use serde_json::{Map, Value};

use crate::tools::protocol::ToolRequest;

/// 规划器输出的调用格式：`[{"alias": "...", "arguments": {...}, "category": "..."}]`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct PlannedCallFormat {
    /// 工具别名，如 list_dir、make_dir
    pub alias: String,
    /// 工具参数
    pub arguments: Map<String, Value>,
    /// 可选类别（fs、net 等），别名解析失败时按类别回退
    pub category: Option<String>,
}

/// 规划输出的 JSON Schema 字符串
pub fn planned_call_schema_json() -> String {
    let schema = schema_for!(Vec<PlannedCallFormat>);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

/// stdio 后端请求行的 JSON Schema 字符串
pub fn tool_request_schema_json() -> String {
    let schema = schema_for!(ToolRequest);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schemas_mention_fields() {
        assert!(planned_call_schema_json().contains("alias"));
        let request = tool_request_schema_json();
        assert!(request.contains("correlation_id"));
        assert!(request.contains("deadline_ms"));
    }
}
