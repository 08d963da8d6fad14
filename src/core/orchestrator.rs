//! 步骤编排器：主控循环
//!
//! 负责：从规划器取步骤、逐步驱动状态机（执行 -> 取证 -> 校验 -> 重试/升级/恢复），
//! 每次迁移后依次写日志、写快照、发进度事件；进程重启后据日志与快照精确续跑。
//!
//! 一次尝试内的调用分两阶段执行：先效果类调用，再观察类调用（由 Verifier::observes 判定），
//! 保证证据中的观察记录总在它所证明的效果之后。

use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::collab::AttemptContext;
use crate::core::builder::Services;
use crate::core::error::OrchestratorError;
use crate::core::state::{ProgressEvent, TaskProgress};
use crate::core::transitions::Transition;
use crate::recovery::{RecoveryContext, RecoveryOutcome};
use crate::store::{PromotionMark, RecoverySnapshot, SnapshotError};
use crate::task::{
    FailureReport, NarrationLog, PlannedCall, StepStatus, Task, TaskOutcome, TaskStatus, ToolInvocationRecord,
};

/// 叙述日志中交给规划器的最近条数
const PLANNER_NARRATION: usize = 10;

/// 一个正在被驱动的任务（内存态）
pub struct TaskRun {
    task: Task,
    narration: NarrationLog,
    /// 当前尝试计划的调用（写入快照）
    pending: Vec<PlannedCall>,
    /// 续跑时从快照取回的未完成调用
    resume_calls: Option<Vec<PlannedCall>>,
    cancel: CancellationToken,
    warnings: Vec<String>,
}

impl TaskRun {
    pub fn task(&self) -> &Task {
        &self.task
    }

    pub fn task_id(&self) -> &str {
        &self.task.id
    }

    pub fn narration(&self) -> &[String] {
        self.narration.entries()
    }

    /// 续跑时产生的用户可见警告（如快照损坏后从头重跑）
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn progress(&self) -> TaskProgress {
        TaskProgress::project(&self.task)
    }
}

pub struct StepOrchestrator {
    services: Arc<Services>,
}

impl StepOrchestrator {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.services.progress.subscribe()
    }

    /// 接受目标：规划步骤并登记任务
    pub async fn start_task(&self, objective: &str) -> Result<TaskRun, OrchestratorError> {
        let descriptions = self
            .services
            .step_planner
            .generate_steps(objective)
            .await
            .map_err(OrchestratorError::Planning)?;
        let task = Task::new(objective, descriptions, self.services.settings.max_attempts);
        self.services.journal.create_task(&task)?;

        let mut run = self.new_run(task, NarrationLog::new(self.services.settings.context_log_limit));
        run.narration
            .push(format!("task accepted: {} ({} steps)", objective, run.task.steps.len()));
        self.write_snapshot(&run)?;
        tracing::info!(task_id = %run.task.id, steps = run.task.steps.len(), "Task started");
        Ok(run)
    }

    /// 驱动到任务终态
    pub async fn run(&self, run: &mut TaskRun) -> Result<TaskOutcome, OrchestratorError> {
        loop {
            match self.advance(run).await? {
                TaskOutcome::StepApproved { .. } => continue,
                outcome => return Ok(outcome),
            }
        }
    }

    /// 驱动当前步骤（第一个未 APPROVED 的步骤）直到 APPROVED 或 ABANDONED
    pub async fn advance(&self, run: &mut TaskRun) -> Result<TaskOutcome, OrchestratorError> {
        match self.drive(run).await {
            Err(OrchestratorError::Cancelled) => self.cancelled(run),
            other => other,
        }
    }

    /// 取消单个任务；运行中的 advance 会在下一个等待点退出
    pub fn abort(&self, task_id: &str) -> bool {
        let found = self.services.tasks.cancel(task_id);
        if found {
            tracing::info!(task_id = %task_id, "Task abort requested");
        }
        found
    }

    /// 进程重启后续跑：日志重建步骤状态，快照提供叙述与未完成调用
    pub async fn resume(&self, task_id: &str) -> Result<TaskRun, OrchestratorError> {
        let journal = &self.services.journal;
        let mut task = journal
            .load_task(task_id)?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        let limit = self.services.settings.context_log_limit;

        let (snapshot, corruption) = match self.services.snapshots.read_latest(task_id) {
            Ok(Some(s)) if task.step(&s.current_step_id).is_none() => (
                None,
                Some(format!("snapshot names unknown step {}", s.current_step_id)),
            ),
            Ok(Some(s)) if s.epoch != task.epoch => {
                tracing::debug!(task_id = %task_id, "Ignoring snapshot from an earlier epoch");
                (None, None)
            }
            Ok(snapshot) => (snapshot, None),
            Err(SnapshotError::Corrupted { reason, .. }) => (None, Some(reason)),
            Err(e) => return Err(e.into()),
        };

        if let Some(reason) = corruption {
            let message = format!(
                "{}; restarting the task from its first step",
                OrchestratorError::SnapshotCorrupted {
                    task_id: task_id.to_string(),
                    reason,
                }
            );
            tracing::warn!(task_id = %task_id, "{}", message);
            let epoch = journal.reset_task(task_id)?;
            task.restart(epoch, self.services.settings.max_attempts);
            let mut run = self.new_run(task, NarrationLog::new(limit));
            run.narration.push(&message);
            run.warnings.push(message.clone());
            self.write_snapshot(&run)?;
            self.services.progress.emit(ProgressEvent::Warning {
                task_id: task_id.to_string(),
                message,
            });
            return Ok(run);
        }

        let narration = match &snapshot {
            Some(s) => NarrationLog::from_entries(s.context_log.clone(), limit),
            None => NarrationLog::new(limit),
        };
        let current = task.current_step_index().map(|i| task.steps[i].clone());
        let mut run = self.new_run(task, narration);

        if let (Some(snapshot), Some(step)) = (snapshot, current.as_ref()) {
            // BEGIN 已入日志但快照没来得及重写时，快照里的待发调用属于上一次尝试，只能重新规划
            if step.status == StepStatus::Executing
                && snapshot.pending_for(&step.id, step.attempt_count, step.heals_used)
            {
                run.resume_calls = Some(snapshot.pending_tool_calls);
            }
        }
        if let Some(step) = current {
            tracing::info!(
                task_id = %task_id,
                step_id = %step.id,
                status = %step.status,
                attempt = step.attempt_count,
                "Task resumed"
            );
            run.narration.push(format!(
                "resumed at {} ({}, attempt {}/{})",
                step.id, step.status, step.attempt_count, step.max_attempts
            ));
        }
        Ok(run)
    }

    /// 续跑日志中所有 ACTIVE / RECOVERING 的任务
    pub async fn resume_all(&self) -> Result<Vec<TaskRun>, OrchestratorError> {
        let mut runs = Vec::new();
        for task_id in self.services.journal.unfinished_task_ids()? {
            match self.resume(&task_id).await {
                Ok(run) => runs.push(run),
                Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Task could not be resumed"),
            }
        }
        Ok(runs)
    }

    /// 任务当前进度（不驱动）
    pub fn status(&self, task_id: &str) -> Result<TaskProgress, OrchestratorError> {
        let task = self
            .services
            .journal
            .load_task(task_id)?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        Ok(TaskProgress::project(&task))
    }

    fn new_run(&self, task: Task, narration: NarrationLog) -> TaskRun {
        let cancel = self.services.tasks.token_for(&task.id);
        TaskRun {
            task,
            narration,
            pending: Vec::new(),
            resume_calls: None,
            cancel,
            warnings: Vec::new(),
        }
    }

    async fn drive(&self, run: &mut TaskRun) -> Result<TaskOutcome, OrchestratorError> {
        match run.task.status {
            TaskStatus::Completed => return Ok(TaskOutcome::Completed),
            TaskStatus::Failed => return Ok(self.already_failed(run)),
            TaskStatus::Active | TaskStatus::Recovering => {}
        }
        let Some(idx) = run.task.current_step_index() else {
            return self.complete_task(run);
        };

        loop {
            if run.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
            let step = &run.task.steps[idx];
            match step.status {
                StepStatus::Pending | StepStatus::Healed => self.run_attempt(run, idx).await?,
                StepStatus::Rejected if step.attempt_count < step.max_attempts => {
                    self.run_attempt(run, idx).await?
                }
                StepStatus::Rejected => {
                    tracing::warn!(
                        step_id = %step.id,
                        "{}",
                        OrchestratorError::EscalationExhausted {
                            step_id: step.id.clone(),
                            attempts: step.attempt_count,
                        }
                    );
                    self.transition(run, idx, Transition::Escalate)?;
                }
                StepStatus::Executing => self.resume_attempt(run, idx).await?,
                StepStatus::AwaitingVerification => self.verify(run, idx).await?,
                StepStatus::Approved => return self.step_approved(run, idx),
                StepStatus::Escalated => {
                    if let Some(outcome) = self.escalated(run, idx).await? {
                        return Ok(outcome);
                    }
                }
                StepStatus::Abandoned => {
                    return self.fail_task(run, idx, "step was abandoned".to_string(), None);
                }
            }
        }
    }

    /// 新一次尝试：规划 -> EXECUTING -> 执行
    async fn run_attempt(&self, run: &mut TaskRun, idx: usize) -> Result<(), OrchestratorError> {
        let step = &run.task.steps[idx];
        let context = AttemptContext {
            attempt: step.attempt_count + 1,
            max_attempts: step.max_attempts,
            prior_rejections: step.rejection_history.clone(),
            narration: run.narration.recent(PLANNER_NARRATION),
        };
        let mut calls = self.plan(run, idx, &context).await?;

        if self.services.settings.inject_retry_context {
            if let Some(rejection) = run.task.steps[idx].latest_rejection() {
                let retry = json!({
                    "attempt": context.attempt,
                    "previous_reasons": rejection.reasons,
                });
                for call in &mut calls {
                    call.arguments.insert("_retry_context".to_string(), retry.clone());
                }
            }
        }

        run.pending = calls.clone();
        self.transition(run, idx, Transition::Begin)?;
        self.execute_calls(run, idx, calls).await
    }

    /// 续跑一个中断的尝试：只补发没有留下记录的调用，不重置计数
    async fn resume_attempt(&self, run: &mut TaskRun, idx: usize) -> Result<(), OrchestratorError> {
        let planned = match run.resume_calls.take() {
            Some(calls) => calls,
            None => {
                let step = &run.task.steps[idx];
                let context = AttemptContext {
                    attempt: step.attempt_count,
                    max_attempts: step.max_attempts,
                    prior_rejections: step.rejection_history.clone(),
                    narration: run.narration.recent(PLANNER_NARRATION),
                };
                self.plan(run, idx, &context).await?
            }
        };
        let outstanding = outstanding_calls(&run.task.steps[idx].current_evidence(), &planned);
        tracing::info!(
            step_id = %run.task.steps[idx].id,
            attempt = run.task.steps[idx].attempt_count,
            outstanding = outstanding.len(),
            "Resuming interrupted attempt"
        );
        run.pending = planned;
        self.execute_calls(run, idx, outstanding).await
    }

    async fn plan(
        &self,
        run: &mut TaskRun,
        idx: usize,
        context: &AttemptContext,
    ) -> Result<Vec<PlannedCall>, OrchestratorError> {
        let cancel = run.cancel.clone();
        let planned = tokio::select! {
            _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
            r = self.services.call_planner.plan_calls(&run.task, &run.task.steps[idx], context) => r,
        };
        match planned {
            Ok(calls) => Ok(calls),
            Err(e) => {
                // 规划失败按空证据处理，由校验门拒绝并计入尝试次数
                tracing::warn!(step_id = %run.task.steps[idx].id, error = %e, "Call planning failed");
                run.narration.push(format!("call planning failed: {e}"));
                Ok(Vec::new())
            }
        }
    }

    /// 分两阶段执行调用，记录证据后提交校验
    async fn execute_calls(
        &self,
        run: &mut TaskRun,
        idx: usize,
        calls: Vec<PlannedCall>,
    ) -> Result<(), OrchestratorError> {
        let (observations, effects): (Vec<PlannedCall>, Vec<PlannedCall>) =
            calls.into_iter().partition(|call| self.is_observation(call));

        for phase in [effects, observations] {
            if phase.is_empty() {
                continue;
            }
            let cancel = run.cancel.clone();
            let records = tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                records = self.dispatch_all(&phase) => records,
            };
            for record in records {
                self.record_evidence(run, idx, record)?;
            }
        }

        run.pending.clear();
        self.transition(run, idx, Transition::Submit)
    }

    async fn dispatch_all(&self, calls: &[PlannedCall]) -> Vec<ToolInvocationRecord> {
        let futures = calls.iter().map(|call| async move {
            let _permit = self.services.scheduler.acquire_call().await;
            let deadline = self.services.settings.timeout_for(call.category.as_deref());
            self.services.router.call(call, deadline).await
        });
        join_all(futures).await
    }

    fn is_observation(&self, call: &PlannedCall) -> bool {
        self.services
            .router
            .resolve(&call.alias, call.category.as_deref())
            .map(|target| self.services.verifier.observes(&target.tool_id))
            .unwrap_or(false)
    }

    fn record_evidence(
        &self,
        run: &mut TaskRun,
        idx: usize,
        mut record: ToolInvocationRecord,
    ) -> Result<(), OrchestratorError> {
        let task = &mut run.task;
        let step = &mut task.steps[idx];
        record.attempt = step.attempt_count;
        record.heal_round = step.heals_used;
        self.services
            .journal
            .record_invocation(&task.id, task.epoch, &step.id, &record)?;
        let outcome = match &record.result.error {
            Some(err) => format!("{:?} {}", record.status, err.code),
            None => format!("{:?}", record.status),
        };
        run.narration
            .push(format!("{} attempt {}: {} -> {}", step.id, record.attempt, record.requested_alias, outcome));
        self.services.progress.emit(ProgressEvent::ToolCall {
            task_id: task.id.clone(),
            step_id: step.id.clone(),
            alias: record.requested_alias.clone(),
            status: record.status,
        });
        step.evidence.push(record);
        Ok(())
    }

    /// AWAITING_VERIFICATION -> APPROVED / REJECTED
    async fn verify(&self, run: &mut TaskRun, idx: usize) -> Result<(), OrchestratorError> {
        let step = &run.task.steps[idx];
        let evidence = step.current_evidence();
        let decision = self.services.verifier.evaluate(step, &evidence).await.normalized();
        match decision {
            crate::verify::Decision::Approve => self.transition(run, idx, Transition::Approve),
            crate::verify::Decision::Reject(reasons) => self.transition(run, idx, Transition::Reject(reasons)),
        }
    }

    /// ESCALATED：至多一次晋升检查，然后跑恢复流水线；返回 Some 表示任务已结束
    async fn escalated(&self, run: &mut TaskRun, idx: usize) -> Result<Option<TaskOutcome>, OrchestratorError> {
        let settings = &self.services.settings;
        let step = &run.task.steps[idx];
        let (step_id, escalation) = (step.id.clone(), step.escalations);

        if step.heals_used >= settings.max_heals_per_step {
            let reason = format!(
                "{}; heal budget of {} already used",
                OrchestratorError::EscalationExhausted {
                    step_id: step_id.clone(),
                    attempts: step.attempt_count,
                },
                settings.max_heals_per_step
            );
            return self.abandon(run, idx, reason, None).map(Some);
        }

        let mark = self
            .services
            .journal
            .promotion_mark(&run.task.id, run.task.epoch, &step_id, escalation)?;
        match mark {
            Some(PromotionMark::Promoted) => {
                tracing::info!(step_id = %step_id, "Patch was already promoted; resuming as healed");
                self.heal(run, idx)?;
                return Ok(None);
            }
            Some(PromotionMark::Started) => {
                let reason = format!(
                    "promotion for escalation {escalation} of {step_id} was interrupted and is not re-applied"
                );
                tracing::warn!(step_id = %step_id, "{}", reason);
                return self.abandon(run, idx, reason, None).map(Some);
            }
            Some(PromotionMark::Failed) => {
                let reason = format!("promotion for escalation {escalation} of {step_id} already failed");
                return self.abandon(run, idx, reason, None).map(Some);
            }
            None => {}
        }

        self.set_task_status(run, TaskStatus::Recovering)?;
        self.services.progress.emit(ProgressEvent::Recovery {
            task_id: run.task.id.clone(),
            step_id: step_id.clone(),
            stage: "opened".to_string(),
            detail: String::new(),
        });

        let ctx = RecoveryContext {
            task: &run.task,
            step: &run.task.steps[idx],
            narration: run.narration.entries().to_vec(),
            cancel: run.cancel.clone(),
        };
        let outcome = self.services.recovery.run(ctx).await?;

        match outcome {
            RecoveryOutcome::Healed(session) => {
                self.services.progress.emit(ProgressEvent::Recovery {
                    task_id: run.task.id.clone(),
                    step_id,
                    stage: "promoted".to_string(),
                    detail: session.summary(),
                });
                run.narration.push(format!("healed: {}", session.summary()));
                self.heal(run, idx)?;
                Ok(None)
            }
            RecoveryOutcome::Abandoned { session, reason } => {
                self.services.progress.emit(ProgressEvent::Recovery {
                    task_id: run.task.id.clone(),
                    step_id,
                    stage: "abandoned".to_string(),
                    detail: reason.clone(),
                });
                self.abandon(run, idx, reason, Some(session.summary())).map(Some)
            }
        }
    }

    /// HEALED：任务回到 ACTIVE
    fn heal(&self, run: &mut TaskRun, idx: usize) -> Result<(), OrchestratorError> {
        self.set_task_status(run, TaskStatus::Active)?;
        let budget = self.services.settings.healed_max_attempts;
        self.transition(run, idx, Transition::Heal { budget })
    }

    fn abandon(
        &self,
        run: &mut TaskRun,
        idx: usize,
        reason: String,
        recovery: Option<String>,
    ) -> Result<TaskOutcome, OrchestratorError> {
        self.transition(run, idx, Transition::Abandon)?;
        self.fail_task(run, idx, reason, recovery)
    }

    fn step_approved(&self, run: &mut TaskRun, idx: usize) -> Result<TaskOutcome, OrchestratorError> {
        if run.task.current_step_index().is_none() {
            return self.complete_task(run);
        }
        let step = &run.task.steps[idx];
        Ok(TaskOutcome::StepApproved {
            step_id: step.id.clone(),
            ordinal: step.ordinal,
            attempts: step.attempt_count,
        })
    }

    fn complete_task(&self, run: &mut TaskRun) -> Result<TaskOutcome, OrchestratorError> {
        self.set_task_status(run, TaskStatus::Completed)?;
        self.services.snapshots.archive(&run.task.id)?;
        self.finish(run);
        tracing::info!(task_id = %run.task.id, "Task completed");
        Ok(TaskOutcome::Completed)
    }

    fn fail_task(
        &self,
        run: &mut TaskRun,
        idx: usize,
        reason: String,
        recovery: Option<String>,
    ) -> Result<TaskOutcome, OrchestratorError> {
        self.set_task_status(run, TaskStatus::Failed)?;
        self.services.snapshots.archive(&run.task.id)?;
        self.finish(run);
        tracing::error!(task_id = %run.task.id, step_id = %run.task.steps[idx].id, reason = %reason, "Task failed");
        let report = FailureReport::for_step(&run.task, &run.task.steps[idx], reason, recovery);
        Ok(TaskOutcome::Failed(Box::new(report)))
    }

    fn already_failed(&self, run: &TaskRun) -> TaskOutcome {
        let idx = run.task.current_step_index().unwrap_or(0);
        match run.task.steps.get(idx) {
            Some(step) => TaskOutcome::Failed(Box::new(FailureReport::for_step(
                &run.task,
                step,
                "task has already failed",
                None,
            ))),
            None => TaskOutcome::Completed,
        }
    }

    /// 取消：关停时保留状态以便续跑；用户 abort 时放弃升级中的步骤并让任务失败
    fn cancelled(&self, run: &mut TaskRun) -> Result<TaskOutcome, OrchestratorError> {
        if self.services.tasks.is_shutting_down() {
            tracing::info!(task_id = %run.task.id, "Task interrupted by shutdown; state kept for resume");
            return Ok(TaskOutcome::Cancelled);
        }
        if let Some(idx) = run.task.current_step_index() {
            if run.task.steps[idx].status == StepStatus::Escalated {
                self.transition(run, idx, Transition::Abandon)?;
            }
        }
        run.pending.clear();
        self.set_task_status(run, TaskStatus::Failed)?;
        self.services.snapshots.archive(&run.task.id)?;
        self.finish(run);
        tracing::warn!(task_id = %run.task.id, "Task aborted");
        Ok(TaskOutcome::Cancelled)
    }

    fn finish(&self, run: &TaskRun) {
        self.services.tasks.release(&run.task.id);
        self.services.progress.emit(ProgressEvent::TaskFinished {
            task_id: run.task.id.clone(),
            status: run.task.status,
        });
    }

    fn set_task_status(&self, run: &mut TaskRun, status: TaskStatus) -> Result<(), OrchestratorError> {
        run.task.status = status;
        self.services.journal.set_task_status(&run.task.id, status)?;
        Ok(())
    }

    /// 迁移并持久化：日志 -> 快照 -> 事件
    fn transition(&self, run: &mut TaskRun, idx: usize, transition: Transition) -> Result<(), OrchestratorError> {
        let (from, to) = run.task.steps[idx].apply(transition)?;
        let task = &run.task;
        let step = &task.steps[idx];
        tracing::info!(
            task_id = %task.id,
            step_id = %step.id,
            from = %from,
            to = %to,
            attempt = step.attempt_count,
            max_attempts = step.max_attempts,
            "Step transition"
        );

        self.services.journal.record_transition(&task.id, task.epoch, step, from)?;
        let mut line = format!(
            "{}: {} -> {} (attempt {}/{})",
            step.id, from, to, step.attempt_count, step.max_attempts
        );
        if let (StepStatus::Rejected, Some(rejection)) = (to, step.latest_rejection()) {
            let reasons: Vec<&str> = rejection.reasons.iter().map(String::as_str).collect();
            line.push_str(&format!(": {}", reasons.join("; ")));
        }
        let event = ProgressEvent::StepTransition {
            task_id: task.id.clone(),
            step_id: step.id.clone(),
            from,
            to,
            attempt: step.attempt_count,
        };
        run.narration.push(line);
        self.write_snapshot(run)?;
        self.services.progress.emit(event);
        Ok(())
    }

    fn write_snapshot(&self, run: &TaskRun) -> Result<(), OrchestratorError> {
        let task = &run.task;
        let current = task
            .current_step_index()
            .or_else(|| task.steps.len().checked_sub(1))
            .and_then(|i| task.steps.get(i));
        let Some(step) = current else {
            return Ok(());
        };
        let snapshot = RecoverySnapshot::new(
            &task.id,
            task.epoch,
            &step.id,
            run.narration.entries().to_vec(),
            run.pending.clone(),
        )
        .at_attempt(step.attempt_count, step.heals_used);
        self.services.snapshots.write(&snapshot)?;
        Ok(())
    }
}

/// 计划中尚未留下记录的调用（按别名与参数逐一抵消）
fn outstanding_calls(recorded: &[ToolInvocationRecord], planned: &[PlannedCall]) -> Vec<PlannedCall> {
    let mut done: Vec<&ToolInvocationRecord> = recorded.iter().collect();
    planned
        .iter()
        .filter(|call| {
            match done
                .iter()
                .position(|r| r.requested_alias == call.alias && r.arguments == call.arguments)
            {
                Some(pos) => {
                    done.remove(pos);
                    false
                }
                None => true,
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{InvocationStatus, ResultEnvelope};
    use chrono::Utc;
    use serde_json::Map;

    fn record(alias: &str, args: serde_json::Value) -> ToolInvocationRecord {
        ToolInvocationRecord {
            requested_alias: alias.into(),
            resolved_target: None,
            arguments: args.as_object().cloned().unwrap_or_else(Map::new),
            result: ResultEnvelope::success(json!("ok")),
            status: InvocationStatus::Ok,
            attempt: 1,
            heal_round: 0,
            correlation_id: "c".into(),
            duration_ms: 0,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_outstanding_skips_recorded_calls_once() {
        let planned = vec![
            PlannedCall::new("make_dir", json!({"path": "a"})),
            PlannedCall::new("make_dir", json!({"path": "a"})),
            PlannedCall::new("list_dir", json!({"path": "."})),
        ];
        let recorded = vec![record("make_dir", json!({"path": "a"}))];
        let outstanding = outstanding_calls(&recorded, &planned);
        assert_eq!(outstanding.len(), 2);
        assert_eq!(outstanding[0].alias, "make_dir");
        assert_eq!(outstanding[1].alias, "list_dir");
    }
}
