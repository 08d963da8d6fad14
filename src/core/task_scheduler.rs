//! 调用调度：一次尝试内的工具调用使用 Semaphore 限制并发

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct TaskScheduler {
    call_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_calls: usize) -> Self {
        Self {
            call_semaphore: Arc::new(Semaphore::new(max_concurrent_calls.max(1))),
        }
    }

    /// 获取调用许可；信号量关闭时返回 None
    pub async fn acquire_call(&self) -> Option<OwnedSemaphorePermit> {
        self.call_semaphore.clone().acquire_owned().await.ok()
    }

    pub fn available(&self) -> usize {
        self.call_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4)
    }
}
