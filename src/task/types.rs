//! 任务数据模型：Task / Step / ToolInvocationRecord / PlannedCall / TaskOutcome
//!
//! Step 只由编排器修改（状态迁移见 core::transitions）；evidence 只追加、不改写。

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::tools::CanonicalTarget;

/// 任务 ID
pub type TaskId = String;
/// 步骤 ID
pub type StepId = String;
/// 工具调用参数（key -> value）
pub type Arguments = Map<String, Value>;

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Active,
    Completed,
    Failed,
    /// 恢复流水线运行中
    Recovering,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "ACTIVE",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Recovering => "RECOVERING",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "ACTIVE" => Some(TaskStatus::Active),
            "COMPLETED" => Some(TaskStatus::Completed),
            "FAILED" => Some(TaskStatus::Failed),
            "RECOVERING" => Some(TaskStatus::Recovering),
            _ => None,
        }
    }

    /// COMPLETED / FAILED 后任务归档
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 步骤状态（迁移边见 core::transitions::EDGES）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Executing,
    AwaitingVerification,
    Approved,
    Rejected,
    Escalated,
    Healed,
    Abandoned,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "PENDING",
            StepStatus::Executing => "EXECUTING",
            StepStatus::AwaitingVerification => "AWAITING_VERIFICATION",
            StepStatus::Approved => "APPROVED",
            StepStatus::Rejected => "REJECTED",
            StepStatus::Escalated => "ESCALATED",
            StepStatus::Healed => "HEALED",
            StepStatus::Abandoned => "ABANDONED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "PENDING" => Some(StepStatus::Pending),
            "EXECUTING" => Some(StepStatus::Executing),
            "AWAITING_VERIFICATION" => Some(StepStatus::AwaitingVerification),
            "APPROVED" => Some(StepStatus::Approved),
            "REJECTED" => Some(StepStatus::Rejected),
            "ESCALATED" => Some(StepStatus::Escalated),
            "HEALED" => Some(StepStatus::Healed),
            "ABANDONED" => Some(StepStatus::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Approved | StepStatus::Abandoned)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单次工具调用的结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Ok,
    Error,
    Timeout,
}

/// 错误描述（后端 error_code + message，或本地分类码）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub code: String,
    pub message: String,
}

impl ErrorDescriptor {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// 统一结果信封：{ok, content, error}
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub ok: bool,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDescriptor>,
}

impl ResultEnvelope {
    pub fn success(content: Value) -> Self {
        Self {
            ok: true,
            content,
            error: None,
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            content: Value::Null,
            error: Some(ErrorDescriptor::new(code, message)),
        }
    }

    /// content 是否「有内容」：null、空串、空数组、空对象都不算
    pub fn has_content(&self) -> bool {
        match &self.content {
            Value::Null => false,
            Value::String(s) => !s.trim().is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Bool(_) | Value::Number(_) => true,
        }
    }
}

/// 一次工具调用的不可变记录（证据 + 审计）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub requested_alias: String,
    /// 解析失败时为 None
    pub resolved_target: Option<CanonicalTarget>,
    pub arguments: Arguments,
    pub result: ResultEnvelope,
    pub status: InvocationStatus,
    /// 产生该记录的尝试序号（从 1 开始）
    #[serde(default)]
    pub attempt: u32,
    /// 产生该记录时步骤已 HEALED 的次数（HEALED 会把 attempt 清零）
    #[serde(default)]
    pub heal_round: u32,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl ToolInvocationRecord {
    pub fn is_ok(&self) -> bool {
        self.status == InvocationStatus::Ok && self.result.ok
    }

    pub fn tool_id(&self) -> Option<&str> {
        self.resolved_target.as_ref().map(|t| t.tool_id.as_str())
    }
}

/// 一次拒绝：原因集合 + 时间
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reasons: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
}

/// 规划器为一次尝试请求的工具调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedCall {
    pub alias: String,
    #[serde(default)]
    pub arguments: Arguments,
    /// 声明的工具类别：决定超时与路由的类别回退
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl PlannedCall {
    pub fn new(alias: impl Into<String>, arguments: Value) -> Self {
        let arguments = match arguments {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            alias: alias.into(),
            arguments,
            category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }
}

/// 单个步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub ordinal: u32,
    pub description: String,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    /// 已经历的 HEALED 次数
    pub heals_used: u32,
    /// 已经历的 ESCALATED 次数（用作恢复会话的序号）
    pub escalations: u32,
    pub evidence: Vec<ToolInvocationRecord>,
    pub rejection_history: Vec<Rejection>,
}

impl Step {
    pub fn new(task_id: &str, ordinal: u32, description: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            id: format!("{task_id}-s{ordinal}"),
            ordinal,
            description: description.into(),
            status: StepStatus::Pending,
            attempt_count: 0,
            max_attempts,
            heals_used: 0,
            escalations: 0,
            evidence: Vec::new(),
            rejection_history: Vec::new(),
        }
    }

    /// 当前尝试产生的证据（Gate 只看这一部分）
    pub fn current_evidence(&self) -> Vec<ToolInvocationRecord> {
        self.evidence
            .iter()
            .filter(|r| r.attempt == self.attempt_count && r.heal_round == self.heals_used)
            .cloned()
            .collect()
    }

    pub fn latest_rejection(&self) -> Option<&Rejection> {
        self.rejection_history.last()
    }

    /// 回到初始状态（快照损坏后从头重跑）
    pub fn reset(&mut self, max_attempts: u32) {
        self.status = StepStatus::Pending;
        self.attempt_count = 0;
        self.max_attempts = max_attempts;
        self.heals_used = 0;
        self.escalations = 0;
        self.evidence.clear();
        self.rejection_history.clear();
    }
}

/// 任务：目标 + 有序步骤
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub objective: String,
    pub steps: Vec<Step>,
    pub status: TaskStatus,
    /// 从头重跑的代数；日志按 epoch 回放
    pub epoch: u32,
    pub created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(objective: impl Into<String>, descriptions: Vec<String>, max_attempts: u32) -> Self {
        Self::with_id(format!("task_{}", uuid::Uuid::new_v4()), objective, descriptions, max_attempts)
    }

    pub fn with_id(
        id: impl Into<String>,
        objective: impl Into<String>,
        descriptions: Vec<String>,
        max_attempts: u32,
    ) -> Self {
        let id = id.into();
        let steps = descriptions
            .into_iter()
            .enumerate()
            .map(|(i, d)| Step::new(&id, i as u32 + 1, d, max_attempts))
            .collect();
        Self {
            id,
            objective: objective.into(),
            steps,
            status: TaskStatus::Active,
            epoch: 0,
            created_at: Utc::now(),
        }
    }

    /// 第一个尚未 APPROVED 的步骤
    pub fn current_step_index(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.status != StepStatus::Approved)
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// 新 epoch：所有步骤回到 PENDING，描述不变
    pub fn restart(&mut self, epoch: u32, max_attempts: u32) {
        self.epoch = epoch;
        self.status = TaskStatus::Active;
        for step in &mut self.steps {
            step.reset(max_attempts);
        }
    }
}

/// 失败报告：随用户可见的失败一起给出完整证据与拒绝历史
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub task_id: TaskId,
    pub step_id: StepId,
    pub ordinal: u32,
    pub description: String,
    pub reason: String,
    pub evidence: Vec<ToolInvocationRecord>,
    pub rejection_history: Vec<Rejection>,
    /// 最近一次恢复会话的摘要
    pub recovery: Option<String>,
}

impl FailureReport {
    pub fn for_step(task: &Task, step: &Step, reason: impl Into<String>, recovery: Option<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            step_id: step.id.clone(),
            ordinal: step.ordinal,
            description: step.description.clone(),
            reason: reason.into(),
            evidence: step.evidence.clone(),
            rejection_history: step.rejection_history.clone(),
            recovery,
        }
    }
}

/// advance 的返回值
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// 一个步骤通过，任务还有后续步骤
    StepApproved {
        step_id: StepId,
        ordinal: u32,
        attempts: u32,
    },
    /// 所有步骤均已通过
    Completed,
    /// 步骤被放弃，任务失败
    Failed(Box<FailureReport>),
    /// 任务被取消
    Cancelled,
}
