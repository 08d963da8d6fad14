//! 证据门（Evidence Gate）
//!
//! 只看当前尝试的证据，按固定规则给出 Approve / Reject(原因集合)：
//! 1. 空证据直接拒绝
//! 2. 每个失败 / 超时的调用都是一条拒绝原因
//! 3. 效果类工具（make_dir 等）成功后，必须有其后的、成功且非空的对应证明（listing / read-back）
//! 4. 至少一条成功且非空的观察（proof_tools 中的工具）；未登记的工具只算声明，不算旁证

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;

use crate::config::VerificationSection;
use crate::core::error::{ResolutionError, ToolError};
use crate::core::transitions::DEFAULT_REJECTION_REASON;
use crate::task::{Step, ToolInvocationRecord};

/// 校验结论
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject(BTreeSet<String>),
}

impl Decision {
    pub fn reject<I, S>(reasons: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Decision::Reject(reasons.into_iter().map(Into::into).collect())
    }

    /// 空原因集合补默认原因
    pub fn normalized(self) -> Self {
        match self {
            Decision::Reject(reasons) if reasons.is_empty() => {
                Decision::Reject(BTreeSet::from([DEFAULT_REJECTION_REASON.to_string()]))
            }
            other => other,
        }
    }

    pub fn is_approved(&self) -> bool {
        matches!(self, Decision::Approve)
    }
}

/// 校验器
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn evaluate(&self, step: &Step, evidence: &[ToolInvocationRecord]) -> Decision;

    /// tool_id 是否为观察类工具（编排器让观察在效果之后执行）
    fn observes(&self, _tool_id: &str) -> bool {
        false
    }
}

/// 规则型证据门
#[derive(Debug, Clone)]
pub struct EvidenceGate {
    proof_tools: HashMap<String, String>,
    required_proof: HashMap<String, String>,
}

impl EvidenceGate {
    pub fn new(proof_tools: HashMap<String, String>, required_proof: HashMap<String, String>) -> Self {
        Self {
            proof_tools,
            required_proof,
        }
    }

    pub fn from_config(section: &VerificationSection) -> Self {
        Self::new(section.proof_tools.clone(), section.required_proof.clone())
    }

    fn proof_kind(&self, record: &ToolInvocationRecord) -> Option<&str> {
        record
            .tool_id()
            .and_then(|tool| self.proof_tools.get(tool))
            .map(String::as_str)
    }

    /// 同步规则判定
    pub fn judge(&self, evidence: &[ToolInvocationRecord]) -> Decision {
        if evidence.is_empty() {
            return Decision::reject(["evidence bundle is empty"]);
        }

        let mut reasons = BTreeSet::new();

        for record in evidence.iter().filter(|r| !r.is_ok()) {
            let alias = &record.requested_alias;
            let reason = match ToolError::from_record(record) {
                Some(ToolError::Timeout(_)) => format!("{alias} timed out"),
                Some(ToolError::Resolution(ResolutionError::NoRoute { .. }))
                | Some(ToolError::Resolution(ResolutionError::EmptyAlias)) => {
                    format!("{alias} could not be resolved to a tool")
                }
                Some(err) => format!("{alias} failed: {err}"),
                None => format!("{alias} failed"),
            };
            reasons.insert(reason);
        }

        for (i, claim) in evidence.iter().enumerate() {
            if !claim.is_ok() {
                continue;
            }
            let Some(required) = claim.tool_id().and_then(|t| self.required_proof.get(t)) else {
                continue;
            };
            let proven = evidence[i + 1..]
                .iter()
                .any(|obs| obs.is_ok() && obs.result.has_content() && self.proof_kind(obs) == Some(required.as_str()));
            if !proven {
                reasons.insert(format!("no {required} proof"));
            }
        }

        // 未登记的工具成功了也只是它自己的说法
        let corroborated = evidence
            .iter()
            .any(|r| r.is_ok() && r.result.has_content() && self.proof_kind(r).is_some());
        if !corroborated {
            reasons.insert("no corroborating evidence".to_string());
        }

        if reasons.is_empty() {
            Decision::Approve
        } else {
            Decision::Reject(reasons)
        }
    }
}

#[async_trait]
impl Verifier for EvidenceGate {
    async fn evaluate(&self, step: &Step, evidence: &[ToolInvocationRecord]) -> Decision {
        let decision = self.judge(evidence);
        if let Decision::Reject(reasons) = &decision {
            tracing::info!(step_id = %step.id, attempt = step.attempt_count, reasons = ?reasons, "Evidence rejected");
        }
        decision
    }

    fn observes(&self, tool_id: &str) -> bool {
        self.proof_tools.contains_key(tool_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{InvocationStatus, ResultEnvelope};
    use crate::tools::CanonicalTarget;
    use chrono::Utc;
    use serde_json::{json, Map, Value};

    fn record(tool: &str, status: InvocationStatus, content: Value) -> ToolInvocationRecord {
        let result = match status {
            InvocationStatus::Ok => ResultEnvelope::success(content),
            InvocationStatus::Timeout => ResultEnvelope::failure("timeout", "no response"),
            InvocationStatus::Error => ResultEnvelope::failure("EACCES", "denied"),
        };
        ToolInvocationRecord {
            requested_alias: tool.into(),
            resolved_target: Some(CanonicalTarget::new("local", tool)),
            arguments: Map::new(),
            result,
            status,
            attempt: 1,
            heal_round: 0,
            correlation_id: "c".into(),
            duration_ms: 1,
            timestamp: Utc::now(),
        }
    }

    fn gate() -> EvidenceGate {
        EvidenceGate::from_config(&VerificationSection::default())
    }

    #[test]
    fn test_empty_bundle_is_rejected() {
        assert_eq!(gate().judge(&[]), Decision::reject(["evidence bundle is empty"]));
    }

    #[test]
    fn test_claim_without_listing_is_rejected() {
        let evidence = vec![record("make_dir", InvocationStatus::Ok, json!({"created": "a"}))];
        let Decision::Reject(reasons) = gate().judge(&evidence) else {
            panic!("expected rejection");
        };
        assert!(reasons.contains("no listing proof"));
    }

    #[test]
    fn test_claim_with_later_listing_is_approved() {
        let evidence = vec![
            record("make_dir", InvocationStatus::Ok, json!({"created": "a"})),
            record("list_dir", InvocationStatus::Ok, json!(["a/"])),
        ];
        assert_eq!(gate().judge(&evidence), Decision::Approve);
    }

    #[test]
    fn test_listing_before_claim_does_not_count() {
        let evidence = vec![
            record("list_dir", InvocationStatus::Ok, json!(["a/"])),
            record("make_dir", InvocationStatus::Ok, json!({"created": "a"})),
        ];
        assert!(!gate().judge(&evidence).is_approved());
    }

    #[test]
    fn test_empty_listing_is_not_proof() {
        let evidence = vec![
            record("make_dir", InvocationStatus::Ok, json!({"created": "a"})),
            record("list_dir", InvocationStatus::Ok, json!([])),
        ];
        let Decision::Reject(reasons) = gate().judge(&evidence) else {
            panic!("expected rejection");
        };
        assert!(reasons.contains("no listing proof"));
        assert!(reasons.contains("no corroborating evidence"));
    }

    #[test]
    fn test_failures_each_yield_reason() {
        let evidence = vec![
            record("list_dir", InvocationStatus::Timeout, Value::Null),
            record("read_file", InvocationStatus::Error, Value::Null),
            record("echo", InvocationStatus::Ok, json!("hi")),
        ];
        let Decision::Reject(reasons) = gate().judge(&evidence) else {
            panic!("expected rejection");
        };
        assert!(reasons.contains("list_dir timed out"));
        assert!(reasons.iter().any(|r| r.starts_with("read_file failed")));
    }

    #[test]
    fn test_unlisted_tool_cannot_approve_itself() {
        let evidence = vec![record("create_dirs", InvocationStatus::Ok, json!("created 5 directories"))];
        assert_eq!(gate().judge(&evidence), Decision::reject(["no corroborating evidence"]));

        let evidence = vec![
            record("create_dirs", InvocationStatus::Ok, json!("created 5 directories")),
            record("list_dir", InvocationStatus::Ok, json!(["a/", "b/"])),
        ];
        assert_eq!(gate().judge(&evidence), Decision::Approve);
    }

    #[test]
    fn test_normalized_fills_empty_reasons() {
        let d = Decision::Reject(BTreeSet::new()).normalized();
        assert_eq!(d, Decision::reject([DEFAULT_REJECTION_REASON]));
    }
}
