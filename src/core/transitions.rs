//! 步骤状态机：唯一合法的迁移边表 + 带副作用的迁移
//!
//! 所有状态变化都经过 `Step::apply`；不在 EDGES 中的迁移返回 IllegalTransition，
//! 且不修改步骤。

use std::collections::BTreeSet;

use chrono::Utc;

use crate::core::error::OrchestratorError;
use crate::task::{Rejection, Step, StepStatus};

/// 合法迁移边
pub const EDGES: &[(StepStatus, StepStatus)] = &[
    (StepStatus::Pending, StepStatus::Executing),
    (StepStatus::Executing, StepStatus::AwaitingVerification),
    (StepStatus::AwaitingVerification, StepStatus::Approved),
    (StepStatus::AwaitingVerification, StepStatus::Rejected),
    (StepStatus::Rejected, StepStatus::Executing),
    (StepStatus::Rejected, StepStatus::Escalated),
    (StepStatus::Escalated, StepStatus::Healed),
    (StepStatus::Escalated, StepStatus::Abandoned),
    (StepStatus::Healed, StepStatus::Executing),
];

/// 拒绝原因为空时补上的默认原因
pub const DEFAULT_REJECTION_REASON: &str = "verification rejected without a stated reason";

pub fn is_allowed(from: StepStatus, to: StepStatus) -> bool {
    EDGES.iter().any(|&(f, t)| f == from && t == to)
}

/// 一次迁移请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// 开始一次新尝试：attempt_count + 1
    Begin,
    /// 本次尝试的调用全部完成，交给 Gate
    Submit,
    Approve,
    Reject(BTreeSet<String>),
    /// 尝试预算耗尽
    Escalate,
    /// 恢复成功：attempt_count 清零，预算换成 budget
    Heal { budget: u32 },
    Abandon,
}

impl Transition {
    pub fn target(&self) -> StepStatus {
        match self {
            Transition::Begin => StepStatus::Executing,
            Transition::Submit => StepStatus::AwaitingVerification,
            Transition::Approve => StepStatus::Approved,
            Transition::Reject(_) => StepStatus::Rejected,
            Transition::Escalate => StepStatus::Escalated,
            Transition::Heal { .. } => StepStatus::Healed,
            Transition::Abandon => StepStatus::Abandoned,
        }
    }
}

impl Step {
    /// 应用迁移，返回 (from, to)
    pub fn apply(&mut self, transition: Transition) -> Result<(StepStatus, StepStatus), OrchestratorError> {
        let from = self.status;
        let to = transition.target();
        if !is_allowed(from, to) {
            return Err(OrchestratorError::IllegalTransition {
                step_id: self.id.clone(),
                from,
                to,
            });
        }

        match transition {
            Transition::Begin => {
                if self.attempt_count >= self.max_attempts {
                    return Err(OrchestratorError::EscalationExhausted {
                        step_id: self.id.clone(),
                        attempts: self.attempt_count,
                    });
                }
                self.attempt_count += 1;
            }
            Transition::Escalate => {
                // 只有预算耗尽才允许升级
                if self.attempt_count < self.max_attempts {
                    return Err(OrchestratorError::IllegalTransition {
                        step_id: self.id.clone(),
                        from,
                        to,
                    });
                }
                self.escalations += 1;
            }
            Transition::Reject(mut reasons) => {
                if reasons.is_empty() {
                    reasons.insert(DEFAULT_REJECTION_REASON.to_string());
                }
                self.rejection_history.push(Rejection {
                    reasons,
                    timestamp: Utc::now(),
                });
            }
            Transition::Heal { budget } => {
                self.heals_used += 1;
                self.attempt_count = 0;
                self.max_attempts = budget.max(1);
            }
            Transition::Submit | Transition::Approve | Transition::Abandon => {}
        }

        self.status = to;
        Ok((from, to))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(max_attempts: u32) -> Step {
        Step::new("task_t", 1, "create dir", max_attempts)
    }

    fn reject(step: &mut Step, reason: &str) {
        step.apply(Transition::Submit).unwrap();
        step.apply(Transition::Reject(BTreeSet::from([reason.to_string()])))
            .unwrap();
    }

    #[test]
    fn test_edge_table_is_exhaustive_for_allowed_moves() {
        assert!(is_allowed(StepStatus::Pending, StepStatus::Executing));
        assert!(is_allowed(StepStatus::Healed, StepStatus::Executing));
        assert!(!is_allowed(StepStatus::Pending, StepStatus::Approved));
        assert!(!is_allowed(StepStatus::Approved, StepStatus::Executing));
        assert!(!is_allowed(StepStatus::Abandoned, StepStatus::Executing));
        assert!(!is_allowed(StepStatus::Executing, StepStatus::Approved));
        assert_eq!(EDGES.len(), 9);
    }

    #[test]
    fn test_illegal_transition_leaves_step_untouched() {
        let mut s = step(3);
        let err = s.apply(Transition::Approve).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::IllegalTransition {
                from: StepStatus::Pending,
                to: StepStatus::Approved,
                ..
            }
        ));
        assert_eq!(s.status, StepStatus::Pending);
        assert_eq!(s.attempt_count, 0);
    }

    #[test]
    fn test_attempt_budget_then_escalation() {
        let mut s = step(2);
        s.apply(Transition::Begin).unwrap();
        reject(&mut s, "no listing proof");
        // 预算未用完不能升级
        assert!(s.apply(Transition::Escalate).is_err());
        s.apply(Transition::Begin).unwrap();
        reject(&mut s, "no listing proof");
        assert_eq!(s.attempt_count, 2);
        assert!(matches!(
            s.apply(Transition::Begin),
            Err(OrchestratorError::EscalationExhausted { attempts: 2, .. })
        ));
        s.apply(Transition::Escalate).unwrap();
        assert_eq!(s.status, StepStatus::Escalated);
        assert_eq!(s.escalations, 1);
        assert_eq!(s.rejection_history.len(), 2);
    }

    #[test]
    fn test_heal_resets_budget() {
        let mut s = step(1);
        s.apply(Transition::Begin).unwrap();
        reject(&mut s, "r");
        s.apply(Transition::Escalate).unwrap();
        s.apply(Transition::Heal { budget: 3 }).unwrap();
        assert_eq!(s.attempt_count, 0);
        assert_eq!(s.max_attempts, 3);
        assert_eq!(s.heals_used, 1);
        s.apply(Transition::Begin).unwrap();
        assert_eq!(s.attempt_count, 1);
    }

    #[test]
    fn test_empty_rejection_gets_default_reason() {
        let mut s = step(3);
        s.apply(Transition::Begin).unwrap();
        s.apply(Transition::Submit).unwrap();
        s.apply(Transition::Reject(BTreeSet::new())).unwrap();
        let reasons = &s.latest_rejection().unwrap().reasons;
        assert!(reasons.contains(DEFAULT_REJECTION_REASON));
    }
}
