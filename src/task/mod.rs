//! 任务模型：Task / Step / 工具调用记录 / 叙述日志

pub mod narration;
pub mod types;

pub use narration::NarrationLog;
pub use types::{
    Arguments, ErrorDescriptor, FailureReport, InvocationStatus, PlannedCall, Rejection,
    ResultEnvelope, Step, StepId, StepStatus, Task, TaskId, TaskOutcome, TaskStatus,
    ToolInvocationRecord,
};
