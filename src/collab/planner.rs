//! 规划协作方：目标 -> 步骤列表；步骤 + 尝试上下文 -> 工具调用列表
//!
//! 编排器只依赖 StepPlanner / CallPlanner 两个 trait；LlmPlanner 是基于 LlmClient 的默认实现。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::collab::parse::parse_json;
use crate::llm::{LlmClient, Message};
use crate::task::{PlannedCall, Rejection, Step, Task};
use crate::tools::planned_call_schema_json;

/// 本次尝试的上下文（第几次、之前为什么被拒）
#[derive(Debug, Clone, Default)]
pub struct AttemptContext {
    pub attempt: u32,
    pub max_attempts: u32,
    pub prior_rejections: Vec<Rejection>,
    /// 最近的叙述日志
    pub narration: Vec<String>,
}

#[async_trait]
pub trait StepPlanner: Send + Sync {
    /// 目标 -> 有序步骤描述；空列表视为规划失败
    async fn generate_steps(&self, objective: &str) -> Result<Vec<String>, String>;
}

#[async_trait]
pub trait CallPlanner: Send + Sync {
    async fn plan_calls(&self, task: &Task, step: &Step, context: &AttemptContext) -> Result<Vec<PlannedCall>, String>;
}

/// 基于 LLM 的规划器
pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    /// 可用别名（拼入提示词）
    aliases: Vec<String>,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, aliases: Vec<String>) -> Self {
        Self { llm, aliases }
    }

    fn steps_system_prompt() -> String {
        "# task: plan_steps\n\
         Break the user's objective into a short ordered list of concrete, verifiable steps.\n\
         Respond with a JSON array of strings only."
            .to_string()
    }

    fn calls_system_prompt(&self) -> String {
        format!(
            "# task: plan_calls\n\
             Choose the tool calls that perform the given step and then prove it.\n\
             Effects (creating or writing) must be followed by observations (listing, reading back).\n\
             Available tool aliases: {}\n\
             Respond with a JSON array matching this schema:\n{}",
            self.aliases.join(", "),
            planned_call_schema_json()
        )
    }
}

/// LLM 返回的调用格式（arguments 允许缺省）
#[derive(Deserialize)]
struct RawCall {
    alias: String,
    #[serde(default)]
    arguments: Map<String, Value>,
    #[serde(default)]
    category: Option<String>,
}

#[async_trait]
impl StepPlanner for LlmPlanner {
    async fn generate_steps(&self, objective: &str) -> Result<Vec<String>, String> {
        let messages = vec![Message::system(Self::steps_system_prompt()), Message::user(objective)];
        let output = self.llm.complete(&messages).await?;
        let steps: Vec<String> = parse_json(&output)?;
        let steps: Vec<String> = steps
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if steps.is_empty() {
            return Err("planner returned no steps".to_string());
        }
        Ok(steps)
    }
}

#[async_trait]
impl CallPlanner for LlmPlanner {
    async fn plan_calls(&self, task: &Task, step: &Step, context: &AttemptContext) -> Result<Vec<PlannedCall>, String> {
        let mut user = format!(
            "{}\n\nObjective: {}\nStep {} of {}: attempt {} of {}.",
            step.description,
            task.objective,
            step.ordinal,
            task.steps.len(),
            context.attempt,
            context.max_attempts
        );
        if let Some(latest) = context.prior_rejections.last() {
            let reasons: Vec<&str> = latest.reasons.iter().map(String::as_str).collect();
            user.push_str(&format!("\nThe previous attempt was rejected: {}", reasons.join("; ")));
        }
        if !context.narration.is_empty() {
            user.push_str("\nRecent history:\n");
            user.push_str(&context.narration.join("\n"));
        }

        let messages = vec![Message::system(self.calls_system_prompt()), Message::user(user)];
        let output = self.llm.complete(&messages).await?;
        let raw: Vec<RawCall> = parse_json(&output)?;
        Ok(raw
            .into_iter()
            .map(|c| PlannedCall {
                alias: c.alias,
                arguments: c.arguments,
                category: c.category,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;

    #[tokio::test]
    async fn test_generate_steps_from_fenced_output() {
        let llm = Arc::new(MockLlmClient::scripted(["```json\n[\"create dir a\", \" \", \"list root\"]\n```"]));
        let planner = LlmPlanner::new(llm, vec!["make_dir".into()]);
        let steps = planner.generate_steps("make a").await.unwrap();
        assert_eq!(steps, vec!["create dir a".to_string(), "list root".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_plan_is_error() {
        let llm = Arc::new(MockLlmClient::scripted(["[]"]));
        let planner = LlmPlanner::new(llm, vec![]);
        assert!(planner.generate_steps("x").await.is_err());
    }

    #[tokio::test]
    async fn test_plan_calls_defaults_arguments() {
        let llm = Arc::new(MockLlmClient::scripted([
            r#"[{"alias": "make_dir", "arguments": {"path": "a"}}, {"alias": "list_dir", "category": "fs"}]"#,
        ]));
        let planner = LlmPlanner::new(llm, vec![]);
        let task = Task::with_id("task_p", "make a", vec!["create dir a".into()], 3);
        let calls = planner
            .plan_calls(&task, &task.steps[0], &AttemptContext::default())
            .await
            .unwrap();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].arguments.is_empty());
        assert_eq!(calls[1].category.as_deref(), Some("fs"));
    }
}
