//! 任务监管：取消令牌
//!
//! 持有根 CancellationToken（关停时取消全部）；每个任务一个子 token，abort 只取消单个任务。

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct TaskSupervisor {
    root: CancellationToken,
    tasks: Mutex<HashMap<String, CancellationToken>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以外部 token（如关停 token）为根
    pub fn with_root(root: CancellationToken) -> Self {
        Self {
            root,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// 取得任务的 token（不存在则创建子 token）
    pub fn token_for(&self, task_id: &str) -> CancellationToken {
        let mut tasks = match self.tasks.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks
            .entry(task_id.to_string())
            .or_insert_with(|| self.root.child_token())
            .clone()
    }

    /// 取消单个任务
    pub fn cancel(&self, task_id: &str) -> bool {
        let tasks = match self.tasks.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        match tasks.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 任务结束后移除
    pub fn release(&self, task_id: &str) {
        let mut tasks = match self.tasks.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        tasks.remove(task_id);
    }

    pub fn cancel_all(&self) {
        self.root.cancel();
    }

    /// 根 token 已取消（关停中）
    pub fn is_shutting_down(&self) -> bool {
        self.root.is_cancelled()
    }
}
