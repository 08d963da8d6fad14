//! 服务构建器：把配置装配成编排器使用的 Services
//!
//! Services 是显式传入编排器的服务集合（路由器、监管器、校验门、协作方、持久化），
//! 多个任务共享同一个 Services。测试可以用 with_* 替换任意协作方。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::collab::{CallPlanner, Healer, LlmHealer, LlmPlanner, StepPlanner};
use crate::config::{AppConfig, ToolsSection};
use crate::core::error::OrchestratorError;
use crate::core::state::ProgressBus;
use crate::core::task_scheduler::TaskScheduler;
use crate::core::task_supervisor::TaskSupervisor;
use crate::llm::{create_llm_from_config, LlmClient};
use crate::recovery::{RecoveryPipeline, Reproducer, SandboxReproducer};
use crate::store::{FileSnapshotStore, SnapshotStore, TaskJournal};
use crate::supervisor::{ProcessControl, ProcessSupervisor};
use crate::tools::protocol::Backend;
use crate::tools::{builtin_registry, ToolRouter, BUILTIN_BACKEND_ID};
use crate::verify::{EvidenceGate, Verifier};

/// 编排参数
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub max_attempts: u32,
    pub healed_max_attempts: u32,
    pub max_heals_per_step: u32,
    pub context_log_limit: usize,
    pub inject_retry_context: bool,
    pub timeouts: ToolsSection,
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let o = &config.orchestrator;
        Self {
            max_attempts: o.max_attempts,
            healed_max_attempts: o.healed_max_attempts,
            max_heals_per_step: o.max_heals_per_step,
            context_log_limit: o.context_log_limit,
            inject_retry_context: o.inject_retry_context,
            timeouts: config.tools.clone(),
        }
    }

    pub fn timeout_for(&self, category: Option<&str>) -> Duration {
        self.timeouts.timeout_for(category)
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// 编排器依赖的全部服务
pub struct Services {
    pub settings: OrchestratorSettings,
    pub router: Arc<ToolRouter>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub verifier: Arc<dyn Verifier>,
    pub step_planner: Arc<dyn StepPlanner>,
    pub call_planner: Arc<dyn CallPlanner>,
    pub recovery: Arc<RecoveryPipeline>,
    pub journal: Arc<TaskJournal>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub scheduler: Arc<TaskScheduler>,
    pub tasks: Arc<TaskSupervisor>,
    pub progress: ProgressBus,
}

/// Services 构建器
pub struct ServicesBuilder {
    config: AppConfig,
    llm: Option<Arc<dyn LlmClient>>,
    step_planner: Option<Arc<dyn StepPlanner>>,
    call_planner: Option<Arc<dyn CallPlanner>>,
    healer: Option<Arc<dyn Healer>>,
    reproducer: Option<Arc<dyn Reproducer>>,
    verifier: Option<Arc<dyn Verifier>>,
    builtins: Vec<(String, Arc<dyn Backend>)>,
    journal: Option<Arc<TaskJournal>>,
    shutdown: Option<CancellationToken>,
}

impl ServicesBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            llm: None,
            step_planner: None,
            call_planner: None,
            healer: None,
            reproducer: None,
            verifier: None,
            builtins: Vec::new(),
            journal: None,
            shutdown: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_step_planner(mut self, planner: Arc<dyn StepPlanner>) -> Self {
        self.step_planner = Some(planner);
        self
    }

    pub fn with_call_planner(mut self, planner: Arc<dyn CallPlanner>) -> Self {
        self.call_planner = Some(planner);
        self
    }

    pub fn with_healer(mut self, healer: Arc<dyn Healer>) -> Self {
        self.healer = Some(healer);
        self
    }

    pub fn with_reproducer(mut self, reproducer: Arc<dyn Reproducer>) -> Self {
        self.reproducer = Some(reproducer);
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// 额外挂载一个进程内后端
    pub fn with_builtin(mut self, backend_id: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.builtins.push((backend_id.into(), backend));
        self
    }

    /// 复用已打开的日志（测试用内存库）
    pub fn with_journal(mut self, journal: Arc<TaskJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// 关停 token 作为所有任务 token 的根
    pub fn with_shutdown_token(mut self, token: CancellationToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn build(self) -> Result<Services, OrchestratorError> {
        let config = self.config;
        config.validate().map_err(OrchestratorError::Config)?;

        let state_dir: PathBuf = config.app.state_dir.clone();
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| OrchestratorError::Config(format!("create {}: {}", state_dir.display(), e)))?;
        let fs_root = config.fs_root();
        std::fs::create_dir_all(&fs_root)
            .map_err(|e| OrchestratorError::Config(format!("create {}: {}", fs_root.display(), e)))?;

        let mut supervisor = ProcessSupervisor::new(config.backends.clone())
            .with_builtin(BUILTIN_BACKEND_ID, Arc::new(builtin_registry(&fs_root)));
        for (id, backend) in self.builtins {
            supervisor = supervisor.with_builtin(id, backend);
        }
        let supervisor = Arc::new(supervisor);
        let control: Arc<dyn ProcessControl> = supervisor.clone();

        let router = Arc::new(ToolRouter::new(
            config.routing.route_table(),
            control.clone(),
            Duration::from_secs(config.tools.restart_lock_wait_secs),
        ));

        let journal = match self.journal {
            Some(j) => j,
            None => Arc::new(TaskJournal::open(&state_dir.join("journal.db"))?),
        };
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(FileSnapshotStore::new(state_dir.join("snapshots")));

        let llm = match self.llm {
            Some(llm) => llm,
            None => create_llm_from_config(&config.llm),
        };
        let planner = Arc::new(LlmPlanner::new(llm.clone(), router.routes().aliases()));
        let step_planner: Arc<dyn StepPlanner> = match self.step_planner {
            Some(p) => p,
            None => planner.clone(),
        };
        let call_planner: Arc<dyn CallPlanner> = match self.call_planner {
            Some(p) => p,
            None => planner,
        };
        let healer: Arc<dyn Healer> = match self.healer {
            Some(h) => h,
            None => Arc::new(LlmHealer::new(llm.clone())),
        };
        let reproducer: Arc<dyn Reproducer> = match self.reproducer {
            Some(r) => r,
            None => Arc::new(SandboxReproducer::new(
                control.clone(),
                Duration::from_secs(config.recovery.check_timeout_secs),
            )),
        };
        let verifier: Arc<dyn Verifier> = match self.verifier {
            Some(v) => v,
            None => Arc::new(EvidenceGate::from_config(&config.verification)),
        };

        let recovery = Arc::new(RecoveryPipeline::new(
            healer,
            reproducer,
            router.clone(),
            journal.clone(),
            config.sandbox_root(),
            config.recovery.max_escalation_cycles,
        ));

        let tasks = match self.shutdown {
            Some(token) => TaskSupervisor::with_root(token),
            None => TaskSupervisor::new(),
        };

        tracing::info!(
            state_dir = %state_dir.display(),
            backends = ?supervisor.backend_ids(),
            "Services ready"
        );

        Ok(Services {
            settings: OrchestratorSettings::from_config(&config),
            router,
            supervisor,
            verifier,
            step_planner,
            call_planner,
            recovery,
            journal,
            snapshots,
            scheduler: Arc::new(TaskScheduler::new(config.orchestrator.max_concurrent_calls)),
            tasks: Arc::new(tasks),
            progress: ProgressBus::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.state_dir = dir.path().join("state");
        config.tools.fs_root = Some(dir.path().join("ws"));
        let services = ServicesBuilder::new(config).build().unwrap();
        assert!(dir.path().join("state/journal.db").exists());
        assert!(services.router.resolve("list_dir", None).is_ok());
        assert_eq!(services.settings.max_attempts, 3);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = AppConfig::default();
        config.orchestrator.max_attempts = 0;
        assert!(matches!(
            ServicesBuilder::new(config).build(),
            Err(OrchestratorError::Config(_))
        ));
    }
}
