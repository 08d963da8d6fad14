//! 恢复会话数据模型
//!
//! 一次 ESCALATED 对应一个 RecoverySession；只有 verification_result = PASS 的补丁能被晋升。

use serde::{Deserialize, Serialize};

use crate::core::error::OrchestratorError;
use crate::tools::ToolRoute;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationResult {
    Pending,
    Pass,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionStatus {
    NotPromoted,
    Promoted,
    PromotionFailed,
}

/// 候选补丁：改路由、改后端制品、或只重启
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidatePatch {
    /// 把别名改指向另一个目标
    Reroute { route: ToolRoute },
    /// 制品内字符串替换（只替换第一处）
    EditArtifact {
        backend_id: String,
        path: String,
        find: String,
        replace: String,
    },
    /// 整体替换制品内容
    ReplaceArtifact {
        backend_id: String,
        path: String,
        content: String,
    },
    RestartOnly { backend_id: String },
}

impl CandidatePatch {
    /// 受影响的后端（晋升时独占它）
    pub fn backend_id(&self) -> &str {
        match self {
            CandidatePatch::Reroute { route } => &route.target.backend_id,
            CandidatePatch::EditArtifact { backend_id, .. }
            | CandidatePatch::ReplaceArtifact { backend_id, .. }
            | CandidatePatch::RestartOnly { backend_id } => backend_id,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CandidatePatch::Reroute { route } => format!("reroute '{}' to {}", route.alias, route.target),
            CandidatePatch::EditArtifact { backend_id, path, .. } => format!("edit {path} of {backend_id}"),
            CandidatePatch::ReplaceArtifact { backend_id, path, .. } => format!("replace {path} of {backend_id}"),
            CandidatePatch::RestartOnly { backend_id } => format!("restart {backend_id}"),
        }
    }
}

/// 诊断结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub root_cause_summary: String,
    pub candidate_patch: CandidatePatch,
}

/// 沙箱验证失败的候选（下一轮诊断时告诉诊断器别再提）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedCandidate {
    pub root_cause_summary: String,
    pub patch: Option<CandidatePatch>,
    pub reason: String,
}

/// 恢复会话
#[derive(Debug, Clone, Serialize)]
pub struct RecoverySession {
    pub id: String,
    pub triggering_step_id: String,
    pub root_cause_summary: String,
    pub sandbox_workspace_id: Option<String>,
    pub candidate_patch: Option<CandidatePatch>,
    pub verification_result: VerificationResult,
    pub promotion_status: PromotionStatus,
    pub escalation_cycle_count: u32,
    pub abandoned: bool,
    pub failed_candidates: Vec<FailedCandidate>,
}

impl RecoverySession {
    pub fn new(triggering_step_id: impl Into<String>) -> Self {
        Self {
            id: format!("rs_{}", uuid::Uuid::new_v4().simple()),
            triggering_step_id: triggering_step_id.into(),
            root_cause_summary: String::new(),
            sandbox_workspace_id: None,
            candidate_patch: None,
            verification_result: VerificationResult::Pending,
            promotion_status: PromotionStatus::NotPromoted,
            escalation_cycle_count: 0,
            abandoned: false,
            failed_candidates: Vec::new(),
        }
    }

    /// 新一轮诊断：覆盖候选，验证结果回到 PENDING
    pub fn record_diagnosis(&mut self, diagnosis: &Diagnosis) {
        self.root_cause_summary = diagnosis.root_cause_summary.clone();
        self.candidate_patch = Some(diagnosis.candidate_patch.clone());
        self.sandbox_workspace_id = None;
        self.verification_result = VerificationResult::Pending;
    }

    pub fn record_pass(&mut self) {
        self.verification_result = VerificationResult::Pass;
    }

    /// 本轮失败：记下失败候选，cycle + 1
    pub fn record_failed_cycle(&mut self, reason: impl Into<String>) {
        self.verification_result = VerificationResult::Fail;
        self.failed_candidates.push(FailedCandidate {
            root_cause_summary: self.root_cause_summary.clone(),
            patch: self.candidate_patch.clone(),
            reason: reason.into(),
        });
        self.escalation_cycle_count += 1;
    }

    /// 只有 PASS 才能晋升
    pub fn mark_promoted(&mut self) -> Result<(), OrchestratorError> {
        if self.verification_result != VerificationResult::Pass {
            return Err(OrchestratorError::UnverifiedPromotion {
                session_id: self.id.clone(),
            });
        }
        self.promotion_status = PromotionStatus::Promoted;
        Ok(())
    }

    pub fn mark_promotion_failed(&mut self) {
        self.promotion_status = PromotionStatus::PromotionFailed;
    }

    pub fn abandon(&mut self) {
        self.abandoned = true;
    }

    pub fn summary(&self) -> String {
        let patch = self
            .candidate_patch
            .as_ref()
            .map(|p| p.describe())
            .unwrap_or_else(|| "no patch".to_string());
        format!(
            "session {}: {} ({}; verification {:?}, promotion {:?}, {} failed cycles)",
            self.id,
            if self.root_cause_summary.is_empty() {
                "no diagnosis"
            } else {
                self.root_cause_summary.as_str()
            },
            patch,
            self.verification_result,
            self.promotion_status,
            self.escalation_cycle_count
        )
    }
}

/// 恢复流水线结果
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    Healed(RecoverySession),
    Abandoned { session: RecoverySession, reason: String },
}
