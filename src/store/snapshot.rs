//! 恢复快照：当前步骤、叙述日志、待发调用
//!
//! 每次状态迁移后原子覆盖写 active/<task_id>.json；任务结束后移到 archive/。
//! 解析失败或内容与任务不符一律报 Corrupted，由编排器决定从头重跑。

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::fs_atomic::atomic_write_file;
use crate::task::{PlannedCall, StepId, TaskId};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot of task {task_id} is corrupted: {reason}")]
    Corrupted { task_id: String, reason: String },

    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid task id for snapshot: {0}")]
    InvalidTaskId(String),
}

/// 快照内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    pub version: u32,
    pub task_id: TaskId,
    pub epoch: u32,
    pub current_step_id: StepId,
    /// 写快照时当前步骤的尝试序号与治愈轮次；pending_tool_calls 只属于这一次尝试
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub heal_round: u32,
    pub context_log: Vec<String>,
    pub pending_tool_calls: Vec<PlannedCall>,
    pub written_at: DateTime<Utc>,
}

impl RecoverySnapshot {
    pub fn new(
        task_id: impl Into<String>,
        epoch: u32,
        current_step_id: impl Into<String>,
        context_log: Vec<String>,
        pending_tool_calls: Vec<PlannedCall>,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            task_id: task_id.into(),
            epoch,
            current_step_id: current_step_id.into(),
            attempt: 0,
            heal_round: 0,
            context_log,
            pending_tool_calls,
            written_at: Utc::now(),
        }
    }

    pub fn at_attempt(mut self, attempt: u32, heal_round: u32) -> Self {
        self.attempt = attempt;
        self.heal_round = heal_round;
        self
    }

    /// 待发调用是否属于该步骤的这一次尝试
    pub fn pending_for(&self, step_id: &str, attempt: u32, heal_round: u32) -> bool {
        self.current_step_id == step_id && self.attempt == attempt && self.heal_round == heal_round
    }
}

/// 快照存储
pub trait SnapshotStore: Send + Sync {
    /// 原子替换该任务的最新快照
    fn write(&self, snapshot: &RecoverySnapshot) -> Result<(), SnapshotError>;

    /// 不存在返回 Ok(None)
    fn read_latest(&self, task_id: &str) -> Result<Option<RecoverySnapshot>, SnapshotError>;

    /// 任务结束后归档
    fn archive(&self, task_id: &str) -> Result<(), SnapshotError>;

    fn active_task_ids(&self) -> Result<Vec<TaskId>, SnapshotError>;
}

/// 基于目录的快照存储
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    root: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn active_dir(&self) -> PathBuf {
        self.root.join("active")
    }

    fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    fn file_in(&self, dir: &Path, task_id: &str) -> Result<PathBuf, SnapshotError> {
        let valid = !task_id.is_empty()
            && task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(SnapshotError::InvalidTaskId(task_id.to_string()));
        }
        Ok(dir.join(format!("{task_id}.json")))
    }

    /// 测试与诊断用：快照文件路径
    pub fn active_path(&self, task_id: &str) -> Result<PathBuf, SnapshotError> {
        self.file_in(&self.active_dir(), task_id)
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn write(&self, snapshot: &RecoverySnapshot) -> Result<(), SnapshotError> {
        let path = self.file_in(&self.active_dir(), &snapshot.task_id)?;
        let bytes = serde_json::to_vec_pretty(snapshot)?;
        atomic_write_file(&path, &bytes)?;
        Ok(())
    }

    fn read_latest(&self, task_id: &str) -> Result<Option<RecoverySnapshot>, SnapshotError> {
        let path = self.file_in(&self.active_dir(), task_id)?;
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: RecoverySnapshot = serde_json::from_slice(&raw).map_err(|e| SnapshotError::Corrupted {
            task_id: task_id.to_string(),
            reason: e.to_string(),
        })?;
        if snapshot.task_id != task_id {
            return Err(SnapshotError::Corrupted {
                task_id: task_id.to_string(),
                reason: format!("snapshot belongs to task {}", snapshot.task_id),
            });
        }
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Corrupted {
                task_id: task_id.to_string(),
                reason: format!("unsupported snapshot version {}", snapshot.version),
            });
        }
        Ok(Some(snapshot))
    }

    fn archive(&self, task_id: &str) -> Result<(), SnapshotError> {
        let from = self.file_in(&self.active_dir(), task_id)?;
        if !from.exists() {
            return Ok(());
        }
        let to = self.file_in(&self.archive_dir(), task_id)?;
        fs::create_dir_all(self.archive_dir())?;
        fs::rename(&from, &to)?;
        Ok(())
    }

    fn active_task_ids(&self) -> Result<Vec<TaskId>, SnapshotError> {
        let dir = self.active_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let name = entry?.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".json") {
                if !id.starts_with('.') {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
