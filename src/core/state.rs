//! 状态投影：TaskProgress 与进度事件
//!
//! 外部外壳只拿到轻量的 TaskProgress 与 ProgressEvent 广播；完整状态由编排器维护并持久化。

use serde::Serialize;
use tokio::sync::broadcast;

use crate::task::{StepStatus, Task, TaskStatus};

/// 进度事件（广播给外壳）
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    StepTransition {
        task_id: String,
        step_id: String,
        from: StepStatus,
        to: StepStatus,
        attempt: u32,
    },
    ToolCall {
        task_id: String,
        step_id: String,
        alias: String,
        status: crate::task::InvocationStatus,
    },
    Recovery {
        task_id: String,
        step_id: String,
        stage: String,
        detail: String,
    },
    Warning {
        task_id: String,
        message: String,
    },
    TaskFinished {
        task_id: String,
        status: TaskStatus,
    },
}

/// 每个步骤的投影
#[derive(Clone, Debug, Serialize)]
pub struct StepProgress {
    pub id: String,
    pub ordinal: u32,
    pub description: String,
    pub status: StepStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
}

/// 任务投影，轻量且易于渲染
#[derive(Clone, Debug, Serialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub objective: String,
    pub status: TaskStatus,
    pub approved: usize,
    pub total: usize,
    pub current_step: Option<StepProgress>,
    pub steps: Vec<StepProgress>,
}

impl TaskProgress {
    pub fn project(task: &Task) -> Self {
        let steps: Vec<StepProgress> = task
            .steps
            .iter()
            .map(|s| StepProgress {
                id: s.id.clone(),
                ordinal: s.ordinal,
                description: s.description.clone(),
                status: s.status,
                attempt_count: s.attempt_count,
                max_attempts: s.max_attempts,
            })
            .collect();
        let current_step = task.current_step_index().and_then(|i| steps.get(i).cloned());
        Self {
            task_id: task.id.clone(),
            objective: task.objective.clone(),
            status: task.status,
            approved: task.steps.iter().filter(|s| s.status == StepStatus::Approved).count(),
            total: task.steps.len(),
            current_step,
            steps,
        }
    }
}

/// 进度广播（无订阅者时发送失败可忽略）
#[derive(Clone)]
pub struct ProgressBus {
    tx: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}
