//! Mock LLM 客户端（本地试跑与测试用，无需 API）
//!
//! 先按顺序吐出预置回复；用完后按 system 提示首行的 `# task: <kind>` 给出固定回复：
//! plan_steps 把目标原样作为唯一步骤，plan_calls 发一次 echo，diagnose 建议重启内置后端。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, Message, Role};

#[derive(Debug, Default)]
pub struct MockLlmClient {
    scripted: Mutex<VecDeque<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置回复，按顺序返回
    pub fn scripted<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scripted: Mutex::new(responses.into_iter().map(Into::into).collect()),
        }
    }
}

fn task_kind(messages: &[Message]) -> Option<&str> {
    messages
        .iter()
        .find(|m| m.role == Role::System)
        .and_then(|m| m.content.lines().next())
        .and_then(|line| line.trim().strip_prefix("# task:"))
        .map(str::trim)
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if let Some(next) = self.scripted.lock().ok().and_then(|mut q| q.pop_front()) {
            return Ok(next);
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");
        let first_line = last_user.lines().next().unwrap_or("").trim();

        let reply = match task_kind(messages) {
            Some("plan_steps") => json!([first_line]).to_string(),
            Some("plan_calls") => json!([{
                "alias": "echo",
                "arguments": { "text": format!("Echo from Mock: {}", first_line) }
            }])
            .to_string(),
            Some("diagnose") => json!({
                "root_cause_summary": "mock diagnosis: restart the builtin backend",
                "candidate_patch": { "kind": "restart_only", "backend_id": crate::tools::BUILTIN_BACKEND_ID }
            })
            .to_string(),
            _ => format!("Echo from Mock: {}", last_user),
        };
        Ok(reply)
    }
}
