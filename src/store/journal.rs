//! 任务日志（SQLite，只追加）
//!
//! 记录任务与步骤定义、每一次状态迁移、每一条工具调用记录、恢复流水线的阶段事件；
//! 重启时按当前 epoch 回放迁移与调用，重建 Task。快照只补充「当前在做什么」。

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::task::{Rejection, Step, StepStatus, Task, TaskId, TaskStatus, ToolInvocationRecord};

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("journal encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("journal io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal lock poisoned")]
    Poisoned,

    #[error("journal is inconsistent: {0}")]
    Corrupt(String),
}

/// 恢复流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStage {
    Opened,
    Diagnosed,
    VerificationPassed,
    VerificationFailed,
    PromotionStarted,
    Promoted,
    PromotionFailed,
    Abandoned,
}

impl RecoveryStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStage::Opened => "opened",
            RecoveryStage::Diagnosed => "diagnosed",
            RecoveryStage::VerificationPassed => "verification_passed",
            RecoveryStage::VerificationFailed => "verification_failed",
            RecoveryStage::PromotionStarted => "promotion_started",
            RecoveryStage::Promoted => "promoted",
            RecoveryStage::PromotionFailed => "promotion_failed",
            RecoveryStage::Abandoned => "abandoned",
        }
    }
}

/// 一条恢复事件
#[derive(Debug, Clone)]
pub struct RecoveryEvent {
    pub task_id: TaskId,
    pub epoch: u32,
    pub step_id: String,
    /// 该步骤第几次 ESCALATED
    pub escalation: u32,
    pub session_id: String,
    pub stage: RecoveryStage,
    pub detail: String,
}

/// 查询到的恢复事件行
#[derive(Debug, Clone)]
pub struct RecoveryEventRow {
    pub step_id: String,
    pub escalation: u32,
    pub session_id: String,
    pub stage: String,
    pub detail: String,
    pub at: DateTime<Utc>,
}

/// 某次升级的晋升进度（用于至多一次晋升）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionMark {
    /// 已开始但没有结论（晋升中途崩溃）
    Started,
    Promoted,
    Failed,
}

/// 任务摘要（status 命令用）
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: TaskId,
    pub objective: String,
    pub status: TaskStatus,
    pub epoch: u32,
    pub updated_at: DateTime<Utc>,
}

pub struct TaskJournal {
    conn: Mutex<Connection>,
}

impl TaskJournal {
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous  = FULL;",
        )?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self, JournalError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, JournalError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id          TEXT PRIMARY KEY,
                objective   TEXT NOT NULL,
                status      TEXT NOT NULL,
                epoch       INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS steps (
                id           TEXT PRIMARY KEY,
                task_id      TEXT NOT NULL,
                ordinal      INTEGER NOT NULL,
                description  TEXT NOT NULL,
                max_attempts INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS transitions (
                seq           INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id       TEXT NOT NULL,
                epoch         INTEGER NOT NULL,
                step_id       TEXT NOT NULL,
                from_status   TEXT NOT NULL,
                to_status     TEXT NOT NULL,
                attempt_count INTEGER NOT NULL,
                max_attempts  INTEGER NOT NULL,
                heals_used    INTEGER NOT NULL,
                escalations   INTEGER NOT NULL,
                reasons       TEXT,
                at            TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS invocations (
                seq      INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id  TEXT NOT NULL,
                epoch    INTEGER NOT NULL,
                step_id  TEXT NOT NULL,
                attempt  INTEGER NOT NULL,
                record   TEXT NOT NULL,
                at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS recovery_events (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id     TEXT NOT NULL,
                epoch       INTEGER NOT NULL,
                step_id     TEXT NOT NULL,
                escalation  INTEGER NOT NULL,
                session_id  TEXT NOT NULL,
                stage       TEXT NOT NULL,
                detail      TEXT NOT NULL,
                at          TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tr_task ON transitions(task_id, epoch, seq);
            CREATE INDEX IF NOT EXISTS idx_inv_task ON invocations(task_id, epoch, seq);
            CREATE INDEX IF NOT EXISTS idx_rec_task ON recovery_events(task_id, epoch, step_id, escalation);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, JournalError> {
        self.conn.lock().map_err(|_| JournalError::Poisoned)
    }

    /// 登记新任务及其步骤
    pub fn create_task(&self, task: &Task) -> Result<(), JournalError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = Utc::now();
        tx.execute(
            "INSERT INTO tasks (id, objective, status, epoch, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![task.id, task.objective, task.status.as_str(), task.epoch, task.created_at, now],
        )?;
        for step in &task.steps {
            tx.execute(
                "INSERT INTO steps (id, task_id, ordinal, description, max_attempts)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![step.id, task.id, step.ordinal, step.description, step.max_attempts],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_task_status(&self, task_id: &str, status: TaskStatus) -> Result<(), JournalError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now(), task_id],
        )?;
        if changed == 0 {
            return Err(JournalError::Corrupt(format!("unknown task {task_id}")));
        }
        Ok(())
    }

    /// 记录一次迁移（step 为迁移后的状态）
    pub fn record_transition(
        &self,
        task_id: &str,
        epoch: u32,
        step: &Step,
        from: StepStatus,
    ) -> Result<(), JournalError> {
        let reasons = match (step.status, step.latest_rejection()) {
            (StepStatus::Rejected, Some(rejection)) => Some(serde_json::to_string(&rejection.reasons)?),
            _ => None,
        };
        let at = match (step.status, step.latest_rejection()) {
            (StepStatus::Rejected, Some(rejection)) => rejection.timestamp,
            _ => Utc::now(),
        };
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO transitions
             (task_id, epoch, step_id, from_status, to_status, attempt_count, max_attempts,
              heals_used, escalations, reasons, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                task_id,
                epoch,
                step.id,
                from.as_str(),
                step.status.as_str(),
                step.attempt_count,
                step.max_attempts,
                step.heals_used,
                step.escalations,
                reasons,
                at,
            ],
        )?;
        conn.execute(
            "UPDATE tasks SET updated_at = ?1 WHERE id = ?2",
            params![Utc::now(), task_id],
        )?;
        Ok(())
    }

    pub fn record_invocation(
        &self,
        task_id: &str,
        epoch: u32,
        step_id: &str,
        record: &ToolInvocationRecord,
    ) -> Result<(), JournalError> {
        let json = serde_json::to_string(record)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO invocations (task_id, epoch, step_id, attempt, record, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![task_id, epoch, step_id, record.attempt, json, record.timestamp],
        )?;
        Ok(())
    }

    pub fn record_recovery_event(&self, event: &RecoveryEvent) -> Result<(), JournalError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO recovery_events
             (task_id, epoch, step_id, escalation, session_id, stage, detail, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.task_id,
                event.epoch,
                event.step_id,
                event.escalation,
                event.session_id,
                event.stage.as_str(),
                event.detail,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    /// 某次升级最近的晋升进度
    pub fn promotion_mark(
        &self,
        task_id: &str,
        epoch: u32,
        step_id: &str,
        escalation: u32,
    ) -> Result<Option<PromotionMark>, JournalError> {
        let conn = self.conn()?;
        let stage: Option<String> = conn
            .query_row(
                "SELECT stage FROM recovery_events
                 WHERE task_id = ?1 AND epoch = ?2 AND step_id = ?3 AND escalation = ?4
                   AND stage IN ('promotion_started', 'promoted', 'promotion_failed')
                 ORDER BY seq DESC LIMIT 1",
                params![task_id, epoch, step_id, escalation],
                |row| row.get(0),
            )
            .optional()?;
        Ok(stage.and_then(|s| match s.as_str() {
            "promotion_started" => Some(PromotionMark::Started),
            "promoted" => Some(PromotionMark::Promoted),
            "promotion_failed" => Some(PromotionMark::Failed),
            _ => None,
        }))
    }

    pub fn recovery_events(&self, task_id: &str) -> Result<Vec<RecoveryEventRow>, JournalError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT step_id, escalation, session_id, stage, detail, at FROM recovery_events
             WHERE task_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![task_id], |row| {
            Ok(RecoveryEventRow {
                step_id: row.get(0)?,
                escalation: row.get(1)?,
                session_id: row.get(2)?,
                stage: row.get(3)?,
                detail: row.get(4)?,
                at: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// 开新 epoch（快照损坏后从头重跑），返回新 epoch
    pub fn reset_task(&self, task_id: &str) -> Result<u32, JournalError> {
        let conn = self.conn()?;
        let epoch: Option<u32> = conn
            .query_row("SELECT epoch FROM tasks WHERE id = ?1", params![task_id], |row| row.get(0))
            .optional()?;
        let next = epoch
            .ok_or_else(|| JournalError::Corrupt(format!("unknown task {task_id}")))?
            + 1;
        conn.execute(
            "UPDATE tasks SET epoch = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
            params![next, TaskStatus::Active.as_str(), Utc::now(), task_id],
        )?;
        Ok(next)
    }

    pub fn list_tasks(&self) -> Result<Vec<TaskSummary>, JournalError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, objective, status, epoch, updated_at FROM tasks ORDER BY created_at, id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, DateTime<Utc>>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, objective, status, epoch, updated_at) = row?;
            let status = TaskStatus::parse(&status)
                .ok_or_else(|| JournalError::Corrupt(format!("task {id} has status {status}")))?;
            out.push(TaskSummary {
                id,
                objective,
                status,
                epoch,
                updated_at,
            });
        }
        Ok(out)
    }

    /// ACTIVE / RECOVERING 的任务（启动时自动恢复）
    pub fn unfinished_task_ids(&self) -> Result<Vec<TaskId>, JournalError> {
        Ok(self
            .list_tasks()?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.id)
            .collect())
    }

    /// 回放当前 epoch 的迁移与调用，重建 Task
    pub fn load_task(&self, task_id: &str) -> Result<Option<Task>, JournalError> {
        let conn = self.conn()?;
        let header = conn
            .query_row(
                "SELECT objective, status, epoch, created_at FROM tasks WHERE id = ?1",
                params![task_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, DateTime<Utc>>(3)?,
                    ))
                },
            )
            .optional()?;
        let Some((objective, status, epoch, created_at)) = header else {
            return Ok(None);
        };
        let status = TaskStatus::parse(&status)
            .ok_or_else(|| JournalError::Corrupt(format!("task {task_id} has status {status}")))?;

        let mut steps = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, ordinal, description, max_attempts FROM steps
                 WHERE task_id = ?1 ORDER BY ordinal",
            )?;
            let rows = stmt.query_map(params![task_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, u32>(3)?,
                ))
            })?;
            for row in rows {
                let (id, ordinal, description, max_attempts) = row?;
                let mut step = Step::new(task_id, ordinal, description, max_attempts);
                step.id = id;
                steps.push(step);
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT step_id, to_status, attempt_count, max_attempts, heals_used, escalations, reasons, at
                 FROM transitions WHERE task_id = ?1 AND epoch = ?2 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![task_id, epoch], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u32>(2)?,
                    row.get::<_, u32>(3)?,
                    row.get::<_, u32>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, DateTime<Utc>>(7)?,
                ))
            })?;
            for row in rows {
                let (step_id, to, attempt_count, max_attempts, heals_used, escalations, reasons, at) = row?;
                let step = steps
                    .iter_mut()
                    .find(|s| s.id == step_id)
                    .ok_or_else(|| JournalError::Corrupt(format!("transition for unknown step {step_id}")))?;
                step.status = StepStatus::parse(&to)
                    .ok_or_else(|| JournalError::Corrupt(format!("unknown step status {to}")))?;
                step.attempt_count = attempt_count;
                step.max_attempts = max_attempts;
                step.heals_used = heals_used;
                step.escalations = escalations;
                if let Some(raw) = reasons {
                    let reasons: BTreeSet<String> = serde_json::from_str(&raw)?;
                    step.rejection_history.push(Rejection { reasons, timestamp: at });
                }
            }
        }

        {
            let mut stmt = conn.prepare(
                "SELECT step_id, record FROM invocations WHERE task_id = ?1 AND epoch = ?2 ORDER BY seq",
            )?;
            let rows = stmt.query_map(params![task_id, epoch], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (step_id, raw) = row?;
                let record: ToolInvocationRecord = serde_json::from_str(&raw)?;
                if let Some(step) = steps.iter_mut().find(|s| s.id == step_id) {
                    step.evidence.push(record);
                }
            }
        }

        Ok(Some(Task {
            id: task_id.to_string(),
            objective,
            steps,
            status,
            epoch,
            created_at,
        }))
    }
}
