//! stdio 后端连接：按行收发 JSON
//!
//! 请求一行一个 ToolRequest；响应一行一个 JSON 对象，必须带回 correlation_id。
//! 后台读取任务按 correlation_id 把响应派发给等待方；子进程 stdout 关闭时所有等待方立即失败。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::supervisor::SupervisorError;
use crate::tools::protocol::{Backend, ToolRequest};

type PendingMap = Arc<StdMutex<HashMap<String, oneshot::Sender<Value>>>>;

/// 单个 stdio 子进程的连接
pub struct StdioConnection {
    backend_id: String,
    stdin: Mutex<ChildStdin>,
    pending: PendingMap,
    reader: JoinHandle<()>,
}

impl StdioConnection {
    /// 接管子进程的 stdin / stdout
    pub fn attach(backend_id: &str, child: &mut Child) -> Result<Self, SupervisorError> {
        let stdin = child.stdin.take().ok_or_else(|| SupervisorError::Spawn {
            backend_id: backend_id.to_string(),
            reason: "stdin not piped".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SupervisorError::Spawn {
            backend_id: backend_id.to_string(),
            reason: "stdout not piped".to_string(),
        })?;
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let reader = tokio::spawn(read_responses(backend_id.to_string(), stdout, pending.clone()));
        Ok(Self {
            backend_id: backend_id.to_string(),
            stdin: Mutex::new(stdin),
            pending,
            reader,
        })
    }

    /// 读取任务是否仍在运行（stdout 未关闭）
    pub fn is_open(&self) -> bool {
        !self.reader.is_finished()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl Drop for StdioConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// 调用结束（完成、超时被取消、出错）时移除等待项
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(self.id);
        }
    }
}

#[async_trait]
impl Backend for StdioConnection {
    async fn call(&self, request: ToolRequest) -> Result<Value, String> {
        let (tx, rx) = oneshot::channel();
        let id = request.correlation_id.clone();
        {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| format!("backend '{}' pending map poisoned", self.backend_id))?;
            pending.insert(id.clone(), tx);
        }
        let _guard = PendingGuard {
            pending: &self.pending,
            id: &id,
        };

        let mut line = serde_json::to_string(&request).map_err(|e| e.to_string())?;
        line.push('\n');
        {
            let mut stdin = self.stdin.lock().await;
            stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| format!("write to backend '{}' failed: {}", self.backend_id, e))?;
            stdin
                .flush()
                .await
                .map_err(|e| format!("flush to backend '{}' failed: {}", self.backend_id, e))?;
        }

        rx.await
            .map_err(|_| format!("backend '{}' closed its output", self.backend_id))
    }
}

async fn read_responses(backend_id: String, stdout: ChildStdout, pending: PendingMap) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(backend = %backend_id, error = %e, "Unparseable backend output line");
                        continue;
                    }
                };
                let Some(id) = value.get("correlation_id").and_then(|v| v.as_str()).map(str::to_string) else {
                    tracing::warn!(backend = %backend_id, "Backend response without correlation_id");
                    continue;
                };
                let waiter = pending.lock().ok().and_then(|mut p| p.remove(&id));
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(value);
                    }
                    None => tracing::debug!(backend = %backend_id, correlation_id = %id, "Late response dropped"),
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(backend = %backend_id, error = %e, "Backend output read failed");
                break;
            }
        }
    }
    // 丢弃所有 sender，等待方收到 RecvError
    if let Ok(mut p) = pending.lock() {
        p.clear();
    }
    tracing::info!(backend = %backend_id, "Backend output closed");
}
