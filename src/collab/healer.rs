//! 诊断协作方：根据失败证据给出根因与候选补丁
//!
//! 之前在沙箱中验证失败的候选会一并交给诊断器，避免重复提出。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::collab::parse::parse_json;
use crate::llm::{LlmClient, Message};
use crate::recovery::{Diagnosis, FailedCandidate};
use crate::task::{Rejection, ToolInvocationRecord};
use crate::tools::ToolRoute;

/// 诊断输入
#[derive(Debug, Clone)]
pub struct DiagnosisRequest {
    pub task_objective: String,
    pub step_id: String,
    pub step_description: String,
    pub evidence: Vec<ToolInvocationRecord>,
    pub rejection_history: Vec<Rejection>,
    pub narration: Vec<String>,
    /// 当前路由
    pub routes: Vec<ToolRoute>,
    pub previous_failures: Vec<FailedCandidate>,
}

#[async_trait]
pub trait Healer: Send + Sync {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, String>;
}

pub struct LlmHealer {
    llm: Arc<dyn LlmClient>,
}

impl LlmHealer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn system_prompt() -> String {
        "# task: diagnose\n\
         A step of an automated task kept failing verification. Find the root cause and propose one patch.\n\
         Patch kinds: reroute {route: {alias, target: {backend_id, tool_id}, priority, category}},\n\
         edit_artifact {backend_id, path, find, replace}, replace_artifact {backend_id, path, content},\n\
         restart_only {backend_id}. Do not repeat a candidate listed under previous failures.\n\
         Respond with JSON: {\"root_cause_summary\": \"...\", \"candidate_patch\": {\"kind\": \"...\", ...}}"
            .to_string()
    }
}

#[async_trait]
impl Healer for LlmHealer {
    async fn diagnose(&self, request: &DiagnosisRequest) -> Result<Diagnosis, String> {
        // 只给最近的证据，避免提示过长
        let recent: Vec<&ToolInvocationRecord> = request.evidence.iter().rev().take(20).collect();
        let body = json!({
            "objective": request.task_objective,
            "step": { "id": request.step_id, "description": request.step_description },
            "recent_evidence": recent,
            "rejections": request.rejection_history,
            "narration": request.narration,
            "routes": request.routes,
            "previous_failures": request.previous_failures,
        });
        let messages = vec![
            Message::system(Self::system_prompt()),
            Message::user(serde_json::to_string_pretty(&body).map_err(|e| e.to_string())?),
        ];
        let output = self.llm.complete(&messages).await?;
        let diagnosis: Diagnosis = parse_json(&output)?;
        tracing::info!(step_id = %request.step_id, patch = %diagnosis.candidate_patch.describe(), "Diagnosis received");
        Ok(diagnosis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlmClient;
    use crate::recovery::CandidatePatch;

    fn request() -> DiagnosisRequest {
        DiagnosisRequest {
            task_objective: "make dirs".into(),
            step_id: "task_h-s1".into(),
            step_description: "create a".into(),
            evidence: vec![],
            rejection_history: vec![],
            narration: vec![],
            routes: vec![],
            previous_failures: vec![],
        }
    }

    #[tokio::test]
    async fn test_mock_diagnosis_parses() {
        let healer = LlmHealer::new(Arc::new(MockLlmClient::new()));
        let diagnosis = healer.diagnose(&request()).await.unwrap();
        assert!(matches!(diagnosis.candidate_patch, CandidatePatch::RestartOnly { .. }));
    }

    #[tokio::test]
    async fn test_garbage_output_is_error() {
        let healer = LlmHealer::new(Arc::new(MockLlmClient::scripted(["I am not sure"])));
        assert!(healer.diagnose(&request()).await.is_err());
    }
}
