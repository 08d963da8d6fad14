//! 恢复流水线：诊断 -> 沙箱隔离 -> 复现验证 -> 晋升
//!
//! 每一阶段都写入任务日志（按 step 的第几次升级区分），崩溃后据此保证同一次升级至多晋升一次。
//! 晋升在受影响后端的独占锁内完成：先改线上路由/制品，再重启后端，最后释放锁。

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::collab::{DiagnosisRequest, Healer};
use crate::core::error::OrchestratorError;
use crate::recovery::sandbox::{edit_text, locate_artifact};
use crate::recovery::{
    CandidatePatch, Diagnosis, RecoveryOutcome, RecoverySession, Reproducer, Sandbox,
};
use crate::store::fs_atomic::atomic_write_file;
use crate::store::{RecoveryEvent, RecoveryStage, TaskJournal};
use crate::task::{Step, Task};
use crate::tools::ToolRouter;

/// 一次恢复所需的上下文
pub struct RecoveryContext<'a> {
    pub task: &'a Task,
    pub step: &'a Step,
    pub narration: Vec<String>,
    pub cancel: CancellationToken,
}

pub struct RecoveryPipeline {
    healer: Arc<dyn Healer>,
    reproducer: Arc<dyn Reproducer>,
    router: Arc<ToolRouter>,
    journal: Arc<TaskJournal>,
    sandbox_root: PathBuf,
    max_escalation_cycles: u32,
}

impl RecoveryPipeline {
    pub fn new(
        healer: Arc<dyn Healer>,
        reproducer: Arc<dyn Reproducer>,
        router: Arc<ToolRouter>,
        journal: Arc<TaskJournal>,
        sandbox_root: impl Into<PathBuf>,
        max_escalation_cycles: u32,
    ) -> Self {
        Self {
            healer,
            reproducer,
            router,
            journal,
            sandbox_root: sandbox_root.into(),
            max_escalation_cycles: max_escalation_cycles.max(1),
        }
    }

    pub async fn run(&self, ctx: RecoveryContext<'_>) -> Result<RecoveryOutcome, OrchestratorError> {
        let mut session = RecoverySession::new(&ctx.step.id);
        self.journal_event(&ctx, &session, RecoveryStage::Opened, "")?;
        tracing::info!(
            task_id = %ctx.task.id,
            step_id = %ctx.step.id,
            session = %session.id,
            "Recovery session opened"
        );

        while session.escalation_cycle_count < self.max_escalation_cycles {
            if ctx.cancel.is_cancelled() {
                return self.cancelled(&ctx, &mut session);
            }

            let request = self.diagnosis_request(&ctx, &session);
            let diagnosis = tokio::select! {
                _ = ctx.cancel.cancelled() => return self.cancelled(&ctx, &mut session),
                d = self.healer.diagnose(&request) => d,
            };
            let diagnosis = match diagnosis {
                Ok(d) => d,
                Err(e) => {
                    let reason = format!("diagnosis failed: {e}");
                    tracing::warn!(session = %session.id, error = %e, "Diagnosis failed");
                    session.record_failed_cycle(&reason);
                    self.journal_event(&ctx, &session, RecoveryStage::VerificationFailed, &reason)?;
                    continue;
                }
            };
            session.record_diagnosis(&diagnosis);
            self.journal_event(
                &ctx,
                &session,
                RecoveryStage::Diagnosed,
                &format!("{}: {}", diagnosis.root_cause_summary, diagnosis.candidate_patch.describe()),
            )?;

            match self.verify_in_sandbox(&ctx, &mut session, &diagnosis).await {
                Ok(()) => {
                    session.record_pass();
                    self.journal_event(&ctx, &session, RecoveryStage::VerificationPassed, "")?;
                    break;
                }
                Err(reason) => {
                    tracing::warn!(session = %session.id, reason = %reason, "Sandbox verification failed");
                    session.record_failed_cycle(&reason);
                    self.journal_event(&ctx, &session, RecoveryStage::VerificationFailed, &reason)?;
                }
            }
        }

        if session.escalation_cycle_count >= self.max_escalation_cycles {
            let reason = OrchestratorError::RecoveryVerificationFailed {
                step_id: ctx.step.id.clone(),
                cycles: session.escalation_cycle_count,
            }
            .to_string();
            session.abandon();
            self.journal_event(&ctx, &session, RecoveryStage::Abandoned, &reason)?;
            return Ok(RecoveryOutcome::Abandoned { session, reason });
        }

        self.promote(&ctx, session).await
    }

    /// 取消：会话标记放弃后返回 Cancelled
    fn cancelled(
        &self,
        ctx: &RecoveryContext<'_>,
        session: &mut RecoverySession,
    ) -> Result<RecoveryOutcome, OrchestratorError> {
        session.abandon();
        self.journal_event(ctx, session, RecoveryStage::Abandoned, "cancelled")?;
        tracing::info!(session = %session.id, "Recovery session abandoned on cancel");
        Err(OrchestratorError::Cancelled)
    }

    async fn verify_in_sandbox(
        &self,
        ctx: &RecoveryContext<'_>,
        session: &mut RecoverySession,
        diagnosis: &Diagnosis,
    ) -> Result<(), String> {
        let patch = &diagnosis.candidate_patch;
        let spec = self.router.backends().spec(patch.backend_id());
        let live_routes = self.router.routes();
        let mut sandbox = Sandbox::isolate(&self.sandbox_root, patch, &live_routes, spec.as_ref())?;
        session.sandbox_workspace_id = Some(sandbox.id().to_string());
        sandbox.apply(patch)?;
        tokio::select! {
            _ = ctx.cancel.cancelled() => Err("cancelled during sandbox verification".to_string()),
            r = self.reproducer.reproduce(&sandbox, patch, ctx.step) => r,
        }
    }

    async fn promote(
        &self,
        ctx: &RecoveryContext<'_>,
        mut session: RecoverySession,
    ) -> Result<RecoveryOutcome, OrchestratorError> {
        let Some(patch) = session.candidate_patch.clone() else {
            return Err(OrchestratorError::UnverifiedPromotion {
                session_id: session.id.clone(),
            });
        };
        if session.verification_result != crate::recovery::VerificationResult::Pass {
            return Err(OrchestratorError::UnverifiedPromotion {
                session_id: session.id.clone(),
            });
        }

        self.journal_event(ctx, &session, RecoveryStage::PromotionStarted, &patch.describe())?;
        match self.apply_live(&patch).await {
            Ok(()) => {
                session.mark_promoted()?;
                self.journal_event(ctx, &session, RecoveryStage::Promoted, &patch.describe())?;
                tracing::info!(session = %session.id, patch = %patch.describe(), "Patch promoted");
                Ok(RecoveryOutcome::Healed(session))
            }
            Err(e) => {
                session.mark_promotion_failed();
                session.abandon();
                let reason = OrchestratorError::PromotionFailed {
                    step_id: ctx.step.id.clone(),
                    reason: e,
                }
                .to_string();
                self.journal_event(ctx, &session, RecoveryStage::PromotionFailed, &reason)?;
                tracing::error!(session = %session.id, reason = %reason, "Promotion failed");
                Ok(RecoveryOutcome::Abandoned { session, reason })
            }
        }
    }

    /// 在独占锁内应用到线上并重启后端
    ///
    /// reroute 同时独占别名原先指向的后端（切换期间不能再有调用落到旧目标），但只重启新目标。
    async fn apply_live(&self, patch: &CandidatePatch) -> Result<(), String> {
        let backend_id = patch.backend_id().to_string();
        let mut lock_ids = vec![backend_id.clone()];
        if let CandidatePatch::Reroute { route } = patch {
            if let Ok(previous) = self.router.resolve(&route.alias, route.category.as_deref()) {
                if previous.backend_id != backend_id {
                    lock_ids.push(previous.backend_id);
                }
            }
        }
        // 固定加锁顺序
        lock_ids.sort();
        let mut locks = Vec::with_capacity(lock_ids.len());
        for id in &lock_ids {
            locks.push(self.router.lock_backend(id).await);
        }

        match patch {
            CandidatePatch::Reroute { route } => {
                let route = route.clone();
                if let Some(lock) = locks.iter().find(|l| l.backend_id() == backend_id) {
                    self.router.swap_routes(lock, |table| table.with_route(route));
                }
            }
            CandidatePatch::EditArtifact { path, find, replace, .. } => {
                let live = self.live_artifact(&backend_id, path)?;
                let updated = edit_text(&live, find, replace)?;
                atomic_write_file(&live, updated.as_bytes()).map_err(|e| e.to_string())?;
            }
            CandidatePatch::ReplaceArtifact { path, content, .. } => {
                let live = self.live_artifact(&backend_id, path)?;
                atomic_write_file(&live, content.as_bytes()).map_err(|e| e.to_string())?;
            }
            CandidatePatch::RestartOnly { .. } => {}
        }
        let restarted = self.router.backends().restart(&backend_id).await;
        drop(locks);
        restarted.map_err(|e| e.to_string())
    }

    fn live_artifact(&self, backend_id: &str, path: &str) -> Result<PathBuf, String> {
        let spec = self
            .router
            .backends()
            .spec(backend_id)
            .ok_or_else(|| format!("unknown backend '{backend_id}'"))?;
        locate_artifact(&spec, path)?;
        Ok(PathBuf::from(path))
    }

    fn diagnosis_request(&self, ctx: &RecoveryContext<'_>, session: &RecoverySession) -> DiagnosisRequest {
        DiagnosisRequest {
            task_objective: ctx.task.objective.clone(),
            step_id: ctx.step.id.clone(),
            step_description: ctx.step.description.clone(),
            evidence: ctx.step.evidence.clone(),
            rejection_history: ctx.step.rejection_history.clone(),
            narration: ctx.narration.clone(),
            routes: self.router.routes().routes().cloned().collect(),
            previous_failures: session.failed_candidates.clone(),
        }
    }

    fn journal_event(
        &self,
        ctx: &RecoveryContext<'_>,
        session: &RecoverySession,
        stage: RecoveryStage,
        detail: &str,
    ) -> Result<(), OrchestratorError> {
        self.journal.record_recovery_event(&RecoveryEvent {
            task_id: ctx.task.id.clone(),
            epoch: ctx.task.epoch,
            step_id: ctx.step.id.clone(),
            escalation: ctx.step.escalations,
            session_id: session.id.clone(),
            stage,
            detail: detail.to_string(),
        })?;
        Ok(())
    }
}
