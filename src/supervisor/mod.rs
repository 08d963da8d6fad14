//! 后端进程监管：启动 / 停止 / 重启 / 取连接
//!
//! 两类后端：
//! - process：外部子进程，stdio 按行 JSON（见 stdio.rs）
//! - builtin：进程内 Backend（如内置 ToolRegistry）
//!
//! `connection` 发现子进程已退出时自动重启一次；路由器只通过 ProcessControl 使用本模块。

pub mod stdio;

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::config::{BackendKind, BackendSection};
use crate::tools::protocol::Backend;

pub use stdio::StdioConnection;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("backend '{backend_id}' failed to start: {reason}")]
    Spawn { backend_id: String, reason: String },

    #[error("backend '{backend_id}' failed to stop: {reason}")]
    Stop { backend_id: String, reason: String },

    #[error("backend '{backend_id}' reset failed: {reason}")]
    Reset { backend_id: String, reason: String },
}

/// 后端生命周期控制（路由器与恢复流水线使用）
#[async_trait]
pub trait ProcessControl: Send + Sync {
    async fn start(&self, backend_id: &str) -> Result<(), SupervisorError>;

    async fn stop(&self, backend_id: &str) -> Result<(), SupervisorError>;

    async fn restart(&self, backend_id: &str) -> Result<(), SupervisorError>;

    /// 取可用连接；进程已退出则先重启
    async fn connection(&self, backend_id: &str) -> Result<Arc<dyn Backend>, SupervisorError>;

    fn is_known(&self, backend_id: &str) -> bool;

    fn spec(&self, backend_id: &str) -> Option<BackendSection>;
}

struct RunningBackend {
    child: Child,
    connection: Arc<StdioConnection>,
}

/// 默认监管器
pub struct ProcessSupervisor {
    specs: HashMap<String, BackendSection>,
    builtins: HashMap<String, Arc<dyn Backend>>,
    processes: Mutex<HashMap<String, RunningBackend>>,
}

impl ProcessSupervisor {
    pub fn new(specs: Vec<BackendSection>) -> Self {
        Self {
            specs: specs.into_iter().map(|s| (s.id.clone(), s)).collect(),
            builtins: HashMap::new(),
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// 挂载进程内后端；未声明时补一条 builtin 规格
    pub fn with_builtin(mut self, backend_id: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        let backend_id = backend_id.into();
        self.specs
            .entry(backend_id.clone())
            .or_insert_with(|| BackendSection::builtin(&backend_id));
        self.builtins.insert(backend_id, backend);
        self
    }

    pub fn backend_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.specs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 停止所有子进程（关停清理用）
    pub async fn stop_all(&self) {
        let mut processes = self.processes.lock().await;
        for (id, mut running) in processes.drain() {
            if let Err(e) = running.child.kill().await {
                tracing::warn!(backend = %id, error = %e, "Failed to kill backend");
            }
        }
    }

    fn spawn(&self, spec: &BackendSection) -> Result<RunningBackend, SupervisorError> {
        let command_text = spec.command.as_deref().unwrap_or("").trim();
        if command_text.is_empty() {
            return Err(SupervisorError::Spawn {
                backend_id: spec.id.clone(),
                reason: "missing command".to_string(),
            });
        }
        let mut command = if spec.args.is_empty() {
            shell_command(command_text)
        } else {
            let mut cmd = Command::new(command_text);
            cmd.args(&spec.args);
            cmd
        };
        command
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        let mut child = command.spawn().map_err(|e| SupervisorError::Spawn {
            backend_id: spec.id.clone(),
            reason: e.to_string(),
        })?;
        let connection = Arc::new(StdioConnection::attach(&spec.id, &mut child)?);
        tracing::info!(backend = %spec.id, pid = ?child.id(), "Backend started");
        Ok(RunningBackend { child, connection })
    }

    fn process_spec(&self, backend_id: &str) -> Result<&BackendSection, SupervisorError> {
        self.specs
            .get(backend_id)
            .ok_or_else(|| SupervisorError::UnknownBackend(backend_id.to_string()))
    }
}

/// 在 shell 中执行一行命令
pub(crate) fn shell_command(command_text: &str) -> Command {
    #[cfg(windows)]
    {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command_text]);
        cmd
    }
    #[cfg(not(windows))]
    {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command_text]);
        cmd
    }
}

#[async_trait]
impl ProcessControl for ProcessSupervisor {
    async fn start(&self, backend_id: &str) -> Result<(), SupervisorError> {
        if self.builtins.contains_key(backend_id) {
            return Ok(());
        }
        let spec = self.process_spec(backend_id)?;
        let mut processes = self.processes.lock().await;
        if let Some(running) = processes.get_mut(backend_id) {
            if matches!(running.child.try_wait(), Ok(None)) && running.connection.is_open() {
                return Ok(());
            }
        }
        let running = self.spawn(spec)?;
        processes.insert(backend_id.to_string(), running);
        Ok(())
    }

    async fn stop(&self, backend_id: &str) -> Result<(), SupervisorError> {
        if self.builtins.contains_key(backend_id) {
            return Ok(());
        }
        self.process_spec(backend_id)?;
        let removed = self.processes.lock().await.remove(backend_id);
        if let Some(mut running) = removed {
            running.child.kill().await.map_err(|e| SupervisorError::Stop {
                backend_id: backend_id.to_string(),
                reason: e.to_string(),
            })?;
            tracing::info!(backend = %backend_id, "Backend stopped");
        }
        Ok(())
    }

    async fn restart(&self, backend_id: &str) -> Result<(), SupervisorError> {
        if let Some(builtin) = self.builtins.get(backend_id) {
            return builtin.reset().await.map_err(|reason| SupervisorError::Reset {
                backend_id: backend_id.to_string(),
                reason,
            });
        }
        self.stop(backend_id).await?;
        self.start(backend_id).await?;
        tracing::info!(backend = %backend_id, "Backend restarted");
        Ok(())
    }

    async fn connection(&self, backend_id: &str) -> Result<Arc<dyn Backend>, SupervisorError> {
        if let Some(builtin) = self.builtins.get(backend_id) {
            return Ok(builtin.clone());
        }
        let spec = self.process_spec(backend_id)?;
        if spec.kind == BackendKind::Builtin {
            return Err(SupervisorError::Spawn {
                backend_id: backend_id.to_string(),
                reason: "builtin backend is not mounted".to_string(),
            });
        }
        let mut processes = self.processes.lock().await;
        if let Some(running) = processes.get_mut(backend_id) {
            let alive = matches!(running.child.try_wait(), Ok(None)) && running.connection.is_open();
            if alive {
                let connection: Arc<dyn Backend> = running.connection.clone();
                return Ok(connection);
            }
            tracing::warn!(backend = %backend_id, "Backend exited unexpectedly, restarting");
        }
        let running = self.spawn(spec)?;
        let connection: Arc<dyn Backend> = running.connection.clone();
        processes.insert(backend_id.to_string(), running);
        Ok(connection)
    }

    fn is_known(&self, backend_id: &str) -> bool {
        self.specs.contains_key(backend_id)
    }

    fn spec(&self, backend_id: &str) -> Option<BackendSection> {
        self.specs.get(backend_id).cloned()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tools::protocol::ToolRequest;
    use serde_json::{json, Map};

    // 读取一行请求，按 correlation_id 回显 tool_id
    const ECHO_BACKEND: &str = r#"while IFS= read -r line; do id=$(printf '%s' "$line" | sed 's/.*"correlation_id":"\([^"]*\)".*/\1/'); printf '{"correlation_id":"%s","content":"pong"}\n' "$id"; done"#;

    fn spec(id: &str, command: &str) -> BackendSection {
        BackendSection {
            id: id.to_string(),
            kind: BackendKind::Process,
            command: Some(command.to_string()),
            ..BackendSection::default()
        }
    }

    fn request(id: &str) -> ToolRequest {
        ToolRequest {
            tool_id: "ping".into(),
            arguments: Map::new(),
            correlation_id: id.into(),
            deadline_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_stdio_round_trip_and_restart() {
        let supervisor = ProcessSupervisor::new(vec![spec("echo", ECHO_BACKEND)]);
        let conn = supervisor.connection("echo").await.unwrap();
        let raw = conn.call(request("c-1")).await.unwrap();
        assert_eq!(raw, json!({"correlation_id": "c-1", "content": "pong"}));

        supervisor.restart("echo").await.unwrap();
        let conn = supervisor.connection("echo").await.unwrap();
        let raw = conn.call(request("c-2")).await.unwrap();
        assert_eq!(raw["correlation_id"], "c-2");
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_exited_backend_fails_pending_and_respawns() {
        let supervisor = ProcessSupervisor::new(vec![spec("quitter", "read -r line; exit 0")]);
        let conn = supervisor.connection("quitter").await.unwrap();
        let err = conn.call(request("c-1")).await.unwrap_err();
        assert!(err.contains("closed"));
        // 再次取连接会重新拉起进程
        let again = supervisor.connection("quitter").await;
        assert!(again.is_ok());
        supervisor.stop_all().await;
    }

    #[tokio::test]
    async fn test_unknown_backend() {
        let supervisor = ProcessSupervisor::new(vec![]);
        assert!(!supervisor.is_known("ghost"));
        assert!(matches!(
            supervisor.connection("ghost").await,
            Err(SupervisorError::UnknownBackend(_))
        ));
    }
}
