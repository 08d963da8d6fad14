//! 编排器错误类型
//!
//! 工具层错误（ToolError）会被编排器吸收为 ERROR / TIMEOUT 调用记录，不会中断步骤；
//! OrchestratorError 才会沿 `?` 冒泡到调用方。

use thiserror::Error;

use crate::store::{JournalError, SnapshotError};
use crate::task::{StepStatus, ToolInvocationRecord};
use crate::tools::protocol::codes;

/// 别名解析失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("empty tool alias")]
    EmptyAlias,

    #[error("no route for alias '{alias}'")]
    NoRoute {
        alias: String,
        category: Option<String>,
    },
}

/// 单次工具调用失败的分类
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("backend error [{code}]: {message}")]
    Backend { code: String, message: String },
}

impl ToolError {
    /// 从失败记录还原分类；成功记录返回 None
    pub fn from_record(record: &ToolInvocationRecord) -> Option<Self> {
        if record.is_ok() {
            return None;
        }
        let (code, message) = record
            .result
            .error
            .as_ref()
            .map(|e| (e.code.as_str(), e.message.clone()))
            .unwrap_or(("backend_error", "backend reported failure".to_string()));
        let err = match code {
            codes::TIMEOUT => ToolError::Timeout(message),
            codes::RESOLUTION_ERROR => ToolError::Resolution(ResolutionError::NoRoute {
                alias: record.requested_alias.clone(),
                category: None,
            }),
            codes::BACKEND_UNAVAILABLE => ToolError::Unavailable(message),
            codes::MALFORMED_RESPONSE => ToolError::Malformed(message),
            other => ToolError::Backend {
                code: other.to_string(),
                message,
            },
        };
        Some(err)
    }
}

/// 编排器错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("illegal transition {from} -> {to} for step {step_id}")]
    IllegalTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("attempt budget exhausted for step {step_id} after {attempts} attempts")]
    EscalationExhausted { step_id: String, attempts: u32 },

    #[error("sandbox verification failed in {cycles} escalation cycles for step {step_id}")]
    RecoveryVerificationFailed { step_id: String, cycles: u32 },

    #[error("promotion failed for step {step_id}: {reason}")]
    PromotionFailed { step_id: String, reason: String },

    #[error("patch of recovery session {session_id} has not passed sandbox verification")]
    UnverifiedPromotion { session_id: String },

    #[error("snapshot of task {task_id} is corrupted: {reason}")]
    SnapshotCorrupted { task_id: String, reason: String },

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("planning failed: {0}")]
    Planning(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}
