//! 内置工具注册表
//!
//! 所有内置工具实现 Tool trait（name / description / execute），ToolRegistry 按名注册与查找；
//! 注册表本身实现 Backend，作为进程内后端挂到 ProcessSupervisor 上，与外部进程后端走同一条分发路径。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::protocol::{Backend, ToolRequest};

/// 工具 trait：名称、描述、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具 ID（路由表中的 tool_id）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 参数 JSON Schema（拼入规划提示词）
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具；Ok 为结果内容，Err 为错误信息
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

/// 工具注册表
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn execute(&self, name: &str, args: Value) -> Result<Value, String> {
        let tool = self.tools.get(name).ok_or_else(|| format!("Unknown tool: {name}"))?;
        tool.execute(args).await
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// 工具描述 JSON（名称、描述、参数 schema）
    pub fn to_schema_json(&self) -> String {
        let mut tools: Vec<Value> = self
            .tools
            .iter()
            .map(|(name, tool)| {
                json!({
                    "name": name,
                    "description": tool.description(),
                    "parameters": tool.parameters_schema()
                })
            })
            .collect();
        tools.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

#[async_trait]
impl Backend for ToolRegistry {
    async fn call(&self, request: ToolRequest) -> Result<Value, String> {
        let args = Value::Object(request.arguments);
        // 工具错误映射为 {error_code, message}，与外部后端的错误形状一致
        match self.execute(&request.tool_id, args).await {
            Ok(content) => Ok(json!({ "content": content })),
            Err(message) if !self.tools.contains_key(&request.tool_id) => Ok(json!({
                "error_code": "unknown_tool",
                "message": message,
            })),
            Err(message) => Ok(json!({
                "error_code": "tool_failed",
                "message": message,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use serde_json::Map;

    fn request(tool_id: &str, arguments: Value) -> ToolRequest {
        ToolRequest {
            tool_id: tool_id.into(),
            arguments: arguments.as_object().cloned().unwrap_or_else(Map::new),
            correlation_id: "c-1".into(),
            deadline_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_registry_as_backend() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        let raw = registry.call(request("echo", json!({"text": "hi"}))).await.unwrap();
        assert_eq!(raw, json!({"content": "hi"}));

        let raw = registry.call(request("nope", json!({}))).await.unwrap();
        assert_eq!(raw["error_code"], "unknown_tool");
    }

    #[test]
    fn test_schema_json_lists_tools() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        assert!(registry.to_schema_json().contains("\"echo\""));
        assert_eq!(registry.tool_names(), vec!["echo".to_string()]);
    }
}
