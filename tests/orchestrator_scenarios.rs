//! 编排器端到端场景
//!
//! 规划器、诊断器、复现器用脚本化替身；工具走真实路由器与内置后端（local + 测试后端）。

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Notify};

use steward::collab::{AttemptContext, CallPlanner, DiagnosisRequest, Healer, StepPlanner};
use steward::config::{AppConfig, BackendSection, RouteSection};
use steward::core::{ProgressEvent, Transition};
use steward::recovery::{CandidatePatch, Diagnosis, Reproducer, Sandbox};
use steward::store::{PromotionMark, RecoveryEvent, RecoveryStage};
use steward::task::{FailureReport, InvocationStatus, PlannedCall, Step, StepStatus, Task, TaskStatus};
use steward::tools::protocol::{Backend, ToolRequest};
use steward::tools::ToolRoute;
use steward::{ServicesBuilder, StepOrchestrator, TaskOutcome};

// ---------- 替身 ----------

struct FixedSteps(Vec<&'static str>);

#[async_trait]
impl StepPlanner for FixedSteps {
    async fn generate_steps(&self, _objective: &str) -> Result<Vec<String>, String> {
        Ok(self.0.iter().map(|s| s.to_string()).collect())
    }
}

fn steps(descriptions: &[&'static str]) -> Arc<FixedSteps> {
    Arc::new(FixedSteps(descriptions.to_vec()))
}

type PlanFn = dyn Fn(&Step, &AttemptContext) -> Vec<PlannedCall> + Send + Sync;

struct ScriptedCalls {
    plan: Box<PlanFn>,
    planned: AtomicU32,
}

impl ScriptedCalls {
    fn new(plan: impl Fn(&Step, &AttemptContext) -> Vec<PlannedCall> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            plan: Box::new(plan),
            planned: AtomicU32::new(0),
        })
    }

    fn planned(&self) -> u32 {
        self.planned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CallPlanner for ScriptedCalls {
    async fn plan_calls(&self, _task: &Task, step: &Step, context: &AttemptContext) -> Result<Vec<PlannedCall>, String> {
        self.planned.fetch_add(1, Ordering::SeqCst);
        Ok((self.plan)(step, context))
    }
}

struct FixedHealer {
    patch: CandidatePatch,
    diagnosed: AtomicU32,
}

impl FixedHealer {
    fn new(patch: CandidatePatch) -> Arc<Self> {
        Arc::new(Self {
            patch,
            diagnosed: AtomicU32::new(0),
        })
    }

    fn diagnosed(&self) -> u32 {
        self.diagnosed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Healer for FixedHealer {
    async fn diagnose(&self, _request: &DiagnosisRequest) -> Result<Diagnosis, String> {
        self.diagnosed.fetch_add(1, Ordering::SeqCst);
        Ok(Diagnosis {
            root_cause_summary: "route points at a missing tool".to_string(),
            candidate_patch: self.patch.clone(),
        })
    }
}

/// 诊断永不返回（用于取消）
struct StuckHealer {
    entered: Arc<Notify>,
}

#[async_trait]
impl Healer for StuckHealer {
    async fn diagnose(&self, _request: &DiagnosisRequest) -> Result<Diagnosis, String> {
        self.entered.notify_one();
        std::future::pending::<Result<Diagnosis, String>>().await
    }
}

struct FixedReproducer(Result<(), String>);

#[async_trait]
impl Reproducer for FixedReproducer {
    async fn reproduce(&self, _sandbox: &Sandbox, _patch: &CandidatePatch, _step: &Step) -> Result<(), String> {
        self.0.clone()
    }
}

/// 第一次调用耗时 12 秒，之后立即返回
#[derive(Default)]
struct SlowReport {
    calls: AtomicU32,
}

#[async_trait]
impl Backend for SlowReport {
    async fn call(&self, _request: ToolRequest) -> Result<Value, String> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(12)).await;
        }
        Ok(json!({ "content": "quarterly report" }))
    }
}

/// hang 为 true 时调用永不返回
#[derive(Default)]
struct Probe {
    hang: AtomicBool,
    calls: AtomicU32,
}

#[async_trait]
impl Backend for Probe {
    async fn call(&self, _request: ToolRequest) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(json!({ "content": "pong" }))
    }
}

/// stuck 为 true 时重启永不完成
#[derive(Default)]
struct StuckRestart {
    stuck: AtomicBool,
}

#[async_trait]
impl Backend for StuckRestart {
    async fn call(&self, _request: ToolRequest) -> Result<Value, String> {
        Ok(json!({ "content": "ok" }))
    }

    async fn reset(&self) -> Result<(), String> {
        if self.stuck.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

// ---------- 工具函数 ----------

fn base_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.app.state_dir = dir.join("state");
    config.tools.fs_root = Some(dir.join("ws"));
    config
}

fn route(alias: &str, backend: &str, tool: &str) -> RouteSection {
    RouteSection {
        alias: alias.to_string(),
        backend: backend.to_string(),
        tool: tool.to_string(),
        priority: 0,
        category: None,
    }
}

fn orchestrator(builder: ServicesBuilder) -> Arc<StepOrchestrator> {
    let services = builder.build().expect("services");
    Arc::new(StepOrchestrator::new(Arc::new(services)))
}

fn make_dir(path: &str) -> PlannedCall {
    PlannedCall::new("make_dir", json!({ "path": path }))
}

fn list_dir() -> PlannedCall {
    PlannedCall::new("list_dir", json!({ "path": "." }))
}

fn proven_dir(step: &Step) -> Vec<PlannedCall> {
    vec![make_dir(&format!("dir{}", step.ordinal)), list_dir()]
}

fn expect_failed(outcome: TaskOutcome) -> FailureReport {
    match outcome {
        TaskOutcome::Failed(report) => *report,
        other => panic!("expected a failed task, got {other:?}"),
    }
}

fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn stages(orch: &StepOrchestrator, task_id: &str) -> Vec<String> {
    orch.services()
        .journal
        .recovery_events(task_id)
        .unwrap()
        .into_iter()
        .map(|e| e.stage)
        .collect()
}

// ---------- 场景 ----------

#[tokio::test]
async fn test_proven_steps_complete_the_task() {
    let dir = tempfile::tempdir().unwrap();
    // 观察写在效果之前，编排器仍先执行效果
    let calls = ScriptedCalls::new(|step, _| {
        let mut planned = proven_dir(step);
        planned.reverse();
        planned
    });
    let orch = orchestrator(
        ServicesBuilder::new(base_config(dir.path()))
            .with_step_planner(steps(&["create dir1", "create dir2"]))
            .with_call_planner(calls.clone()),
    );

    let mut run = orch.start_task("make two directories").await.unwrap();
    let outcome = orch.run(&mut run).await.unwrap();

    assert!(matches!(outcome, TaskOutcome::Completed));
    assert!(dir.path().join("ws/dir1").is_dir());
    assert!(dir.path().join("ws/dir2").is_dir());
    for step in &run.task().steps {
        assert_eq!(step.status, StepStatus::Approved);
        assert_eq!(step.attempt_count, 1);
    }
    let evidence = &run.task().steps[0].evidence;
    assert_eq!(evidence[0].requested_alias, "make_dir");
    assert_eq!(evidence[1].requested_alias, "list_dir");
    assert_eq!(calls.planned(), 2);

    let progress = orch.status(run.task_id()).unwrap();
    assert_eq!(progress.status, TaskStatus::Completed);
    assert_eq!(progress.approved, 2);
    assert!(progress.current_step.is_none());
}

#[tokio::test]
async fn test_missing_listing_proof_escalates_after_three_rejections() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.orchestrator.max_heals_per_step = 0;
    let calls = ScriptedCalls::new(|_, _| vec![make_dir("a")]);
    let orch = orchestrator(
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["create directory a"]))
            .with_call_planner(calls.clone()),
    );
    let mut events = orch.subscribe();

    let mut run = orch.start_task("create a").await.unwrap();
    let report = expect_failed(orch.run(&mut run).await.unwrap());

    assert_eq!(report.rejection_history.len(), 3);
    for rejection in &report.rejection_history {
        assert!(rejection.reasons.contains("no listing proof"));
    }
    assert!(report.reason.contains("heal budget"));

    let step = &run.task().steps[0];
    assert_eq!(step.status, StepStatus::Abandoned);
    assert_eq!(step.attempt_count, 3);
    assert_eq!(calls.planned(), 3);

    let retry = step.evidence.iter().find(|r| r.attempt == 2).unwrap();
    assert_eq!(retry.arguments["_retry_context"]["attempt"], json!(2));

    let escalated = drain(&mut events).into_iter().any(|e| {
        matches!(
            e,
            ProgressEvent::StepTransition {
                to: StepStatus::Escalated,
                attempt: 3,
                ..
            }
        )
    });
    assert!(escalated);
    assert_eq!(orch.status(run.task_id()).unwrap().status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_slow_backend_times_out_and_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.tools.category_timeouts.insert("reports".to_string(), 10);
    config.backends.push(BackendSection::builtin("archive"));
    config.routing.routes.push(route("fetch_report", "archive", "fetch"));
    config
        .verification
        .proof_tools
        .insert("fetch".to_string(), "report".to_string());

    let calls = ScriptedCalls::new(|_, _| vec![PlannedCall::new("fetch_report", json!({})).with_category("reports")]);
    let orch = orchestrator(
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["fetch the quarterly report"]))
            .with_call_planner(calls)
            .with_builtin("archive", Arc::new(SlowReport::default())),
    );

    let mut run = orch.start_task("report").await.unwrap();
    let outcome = orch.run(&mut run).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed));

    let step = &run.task().steps[0];
    assert_eq!(step.evidence[0].status, InvocationStatus::Timeout);
    assert_eq!(step.evidence[0].attempt, 1);
    assert!(step.rejection_history[0].reasons.contains("fetch_report timed out"));
    assert_eq!(step.attempt_count, 2);
    assert_eq!(step.status, StepStatus::Approved);
}

#[tokio::test]
async fn test_recovery_gives_up_after_escalation_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.recovery.max_escalation_cycles = 2;
    let healer = FixedHealer::new(CandidatePatch::RestartOnly {
        backend_id: "local".to_string(),
    });
    let orch = orchestrator(
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["create directory a"]))
            .with_call_planner(ScriptedCalls::new(|_, _| vec![make_dir("a")]))
            .with_healer(healer.clone())
            .with_reproducer(Arc::new(FixedReproducer(Err("failure reproduced".to_string())))),
    );

    let mut run = orch.start_task("create a").await.unwrap();
    let report = expect_failed(orch.run(&mut run).await.unwrap());

    assert!(report.reason.starts_with("sandbox verification failed in 2"));
    assert!(report.recovery.as_deref().unwrap().contains("2 failed cycles"));
    assert_eq!(healer.diagnosed(), 2);
    assert_eq!(run.task().steps[0].status, StepStatus::Abandoned);

    let stages = stages(&orch, run.task_id());
    assert_eq!(stages.iter().filter(|s| *s == "verification_failed").count(), 2);
    assert!(!stages.iter().any(|s| s == "promotion_started"));
    assert_eq!(stages.last().map(String::as_str), Some("abandoned"));
}

#[tokio::test]
async fn test_verified_reroute_heals_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.routing.routes.push(route("list_files", "local", "missing_tool"));
    let healer = FixedHealer::new(CandidatePatch::Reroute {
        route: ToolRoute::new("list_files", "local", "list_dir"),
    });
    let orch = orchestrator(
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["create directory a"]))
            .with_call_planner(ScriptedCalls::new(|_, _| {
                vec![make_dir("a"), PlannedCall::new("list_files", json!({ "path": "." }))]
            }))
            .with_healer(healer.clone()),
    );

    let mut run = orch.start_task("create a").await.unwrap();
    let outcome = orch.run(&mut run).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed));

    let step = &run.task().steps[0];
    assert_eq!(step.heals_used, 1);
    assert_eq!(step.attempt_count, 1);
    assert_eq!(step.rejection_history.len(), 3);
    assert_eq!(healer.diagnosed(), 1);

    let target = orch.services().router.resolve("list_files", None).unwrap();
    assert_eq!(target.tool_id, "list_dir");
    let stages = stages(&orch, run.task_id());
    assert!(stages.iter().any(|s| s == "verification_passed"));
    assert_eq!(stages.last().map(String::as_str), Some("promoted"));
}

#[tokio::test]
async fn test_reroute_to_missing_tool_is_never_promoted() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.recovery.max_escalation_cycles = 2;
    config.routing.routes.push(route("list_files", "local", "missing_tool"));
    let healer = FixedHealer::new(CandidatePatch::Reroute {
        route: ToolRoute::new("list_files", "local", "still_missing_tool"),
    });
    let orch = orchestrator(
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["create directory a"]))
            .with_call_planner(ScriptedCalls::new(|_, _| {
                vec![make_dir("a"), PlannedCall::new("list_files", json!({ "path": "." }))]
            }))
            .with_healer(healer.clone()),
    );

    let mut run = orch.start_task("create a").await.unwrap();
    let report = expect_failed(orch.run(&mut run).await.unwrap());

    assert!(report.reason.starts_with("sandbox verification failed in 2"));
    assert_eq!(healer.diagnosed(), 2);
    let step = &run.task().steps[0];
    assert_eq!(step.status, StepStatus::Abandoned);
    assert_eq!(step.heals_used, 0);

    let target = orch.services().router.resolve("list_files", None).unwrap();
    assert_eq!(target.tool_id, "missing_tool");
    let stages = stages(&orch, run.task_id());
    assert!(!stages.iter().any(|s| s == "verification_passed"));
    assert!(!stages.iter().any(|s| s == "promotion_started"));
    let events = orch.services().journal.recovery_events(run.task_id()).unwrap();
    assert!(events
        .iter()
        .any(|e| e.stage == "verification_failed" && e.detail.contains("still fails")));
}

#[tokio::test]
async fn test_failed_promotion_abandons_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.backends.push(BackendSection {
        id: "desk".to_string(),
        command: Some("/nonexistent/steward-desk".to_string()),
        args: vec!["--stdio".to_string()],
        ..BackendSection::default()
    });
    let orch = orchestrator(
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["create directory a"]))
            .with_call_planner(ScriptedCalls::new(|_, _| vec![make_dir("a")]))
            .with_healer(FixedHealer::new(CandidatePatch::RestartOnly {
                backend_id: "desk".to_string(),
            }))
            .with_reproducer(Arc::new(FixedReproducer(Ok(())))),
    );

    let mut run = orch.start_task("create a").await.unwrap();
    let report = expect_failed(orch.run(&mut run).await.unwrap());

    assert!(report.reason.starts_with("promotion failed"));
    assert!(report.recovery.is_some());
    let step = &run.task().steps[0];
    assert_eq!(step.status, StepStatus::Abandoned);
    let mark = orch
        .services()
        .journal
        .promotion_mark(run.task_id(), run.task().epoch, &step.id, step.escalations)
        .unwrap();
    assert_eq!(mark, Some(PromotionMark::Failed));
}

#[tokio::test]
async fn test_resume_reissues_only_the_interrupted_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(dir.path());
    config.backends.push(BackendSection::builtin("probe"));
    config.routing.routes.push(route("probe", "probe", "ping"));

    // 第 4 步第 1 次缺少证明；第 2 次再调用会卡住的 probe
    let calls = ScriptedCalls::new(|step, context| match (step.ordinal, context.attempt) {
        (4, 1) => vec![make_dir("dir4")],
        (4, _) => vec![make_dir("dir4"), PlannedCall::new("probe", json!({})), list_dir()],
        _ => proven_dir(step),
    });
    let probe = Arc::new(Probe::default());
    probe.hang.store(true, Ordering::SeqCst);
    let builder = |config: AppConfig| {
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["one", "two", "three", "four"]))
            .with_call_planner(calls.clone())
            .with_builtin("probe", probe.clone())
    };

    let first = orchestrator(builder(config.clone()));
    let mut events = first.subscribe();
    let mut run = first.start_task("four directories").await.unwrap();
    let task_id = run.task_id().to_string();
    let runner = first.clone();
    let handle = tokio::spawn(async move { runner.run(&mut run).await });

    loop {
        match events.recv().await.unwrap() {
            ProgressEvent::StepTransition {
                step_id,
                to: StepStatus::Executing,
                attempt: 2,
                ..
            } if step_id.ends_with("-s4") => break,
            _ => continue,
        }
    }
    tokio::task::yield_now().await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    assert_eq!(calls.planned(), 5);

    // 进程“重启”
    probe.hang.store(false, Ordering::SeqCst);
    let second = orchestrator(builder(config));
    let mut resumed = second.resume(&task_id).await.unwrap();
    {
        let task = resumed.task();
        assert!(task.steps[..3].iter().all(|s| s.status == StepStatus::Approved));
        assert_eq!(task.steps[3].status, StepStatus::Executing);
        assert_eq!(task.steps[3].attempt_count, 2);
        assert_eq!(task.steps[3].rejection_history.len(), 1);
    }

    let outcome = second.run(&mut resumed).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed));
    assert_eq!(calls.planned(), 5);
    let task = resumed.task();
    assert_eq!(task.steps[3].attempt_count, 2);
    assert_eq!(task.steps[3].status, StepStatus::Approved);
    assert_eq!(task.steps[0].evidence.len(), 2);
    assert!(resumed.narration().iter().any(|line| line.contains("resumed at")));
}

#[tokio::test]
async fn test_begin_without_snapshot_replans_the_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let calls = ScriptedCalls::new(|step, _| proven_dir(step));
    let builder = |config: AppConfig| {
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["create dir1"]))
            .with_call_planner(calls.clone())
    };

    // BEGIN 入日志后、快照重写前崩溃：快照仍是接受任务时写的那份
    let first = orchestrator(builder(config.clone()));
    let run = first.start_task("one directory").await.unwrap();
    let task_id = run.task_id().to_string();
    let mut step = run.task().steps[0].clone();
    let from = step.status;
    step.apply(Transition::Begin).unwrap();
    first
        .services()
        .journal
        .record_transition(&task_id, run.task().epoch, &step, from)
        .unwrap();
    drop(run);

    let second = orchestrator(builder(config));
    let mut resumed = second.resume(&task_id).await.unwrap();
    assert_eq!(resumed.task().steps[0].status, StepStatus::Executing);
    assert_eq!(resumed.task().steps[0].attempt_count, 1);

    let outcome = second.run(&mut resumed).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed));
    let step = &resumed.task().steps[0];
    assert_eq!(step.attempt_count, 1);
    assert!(step.rejection_history.is_empty());
    assert_eq!(calls.planned(), 1);
    assert!(dir.path().join("ws/dir1").is_dir());
}

#[tokio::test]
async fn test_corrupt_snapshot_restarts_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let config = base_config(dir.path());
    let calls = ScriptedCalls::new(|step, _| proven_dir(step));
    let builder = |config: AppConfig| {
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["one", "two"]))
            .with_call_planner(calls.clone())
    };

    let first = orchestrator(builder(config.clone()));
    let mut run = first.start_task("two directories").await.unwrap();
    let outcome = first.advance(&mut run).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::StepApproved { ordinal: 1, .. }));
    let task_id = run.task_id().to_string();

    let snapshot = dir
        .path()
        .join("state/snapshots/active")
        .join(format!("{task_id}.json"));
    std::fs::write(&snapshot, b"{ not json").unwrap();

    let second = orchestrator(builder(config));
    let mut events = second.subscribe();
    let mut resumed = second.resume(&task_id).await.unwrap();
    assert_eq!(resumed.task().epoch, 1);
    assert!(resumed.task().steps.iter().all(|s| s.status == StepStatus::Pending));
    assert_eq!(resumed.warnings().len(), 1);
    assert!(resumed.warnings()[0].contains("corrupted"));
    assert!(drain(&mut events)
        .iter()
        .any(|e| matches!(e, ProgressEvent::Warning { .. })));

    let outcome = second.run(&mut resumed).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed));
    assert!(resumed.task().steps.iter().all(|s| s.attempt_count == 1));
    let reloaded = second.services().journal.load_task(&task_id).unwrap().unwrap();
    assert_eq!(reloaded.epoch, 1);
    assert_eq!(reloaded.steps[0].evidence.len(), 2);
}

/// 让晋升卡在后端重启处，然后中止运行；返回任务 ID
async fn crash_during_promotion(
    config: AppConfig,
    healer: Arc<FixedHealer>,
    desk: Arc<StuckRestart>,
) -> String {
    desk.stuck.store(true, Ordering::SeqCst);
    let orch = orchestrator(
        ServicesBuilder::new(config)
            .with_step_planner(steps(&["create directory a"]))
            .with_call_planner(ScriptedCalls::new(|_, _| vec![make_dir("a")]))
            .with_healer(healer)
            .with_reproducer(Arc::new(FixedReproducer(Ok(()))))
            .with_builtin("desk", desk),
    );
    let mut run = orch.start_task("create a").await.unwrap();
    let task_id = run.task_id().to_string();
    let runner = orch.clone();
    let handle = tokio::spawn(async move { runner.run(&mut run).await });

    for _ in 0..500 {
        if stages(&orch, &task_id).iter().any(|s| s == "promotion_started") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(stages(&orch, &task_id).iter().any(|s| s == "promotion_started"));
    handle.abort();
    let _ = handle.await;
    task_id
}

fn promotion_config(dir: &Path) -> AppConfig {
    let mut config = base_config(dir);
    config.backends.push(BackendSection::builtin("desk"));
    config
}

#[tokio::test]
async fn test_interrupted_promotion_is_not_reapplied() {
    let dir = tempfile::tempdir().unwrap();
    let healer = FixedHealer::new(CandidatePatch::RestartOnly {
        backend_id: "desk".to_string(),
    });
    let desk = Arc::new(StuckRestart::default());
    let task_id = crash_during_promotion(promotion_config(dir.path()), healer.clone(), desk.clone()).await;

    desk.stuck.store(false, Ordering::SeqCst);
    let orch = orchestrator(
        ServicesBuilder::new(promotion_config(dir.path()))
            .with_step_planner(steps(&["create directory a"]))
            .with_call_planner(ScriptedCalls::new(|_, _| vec![make_dir("a")]))
            .with_healer(healer.clone())
            .with_builtin("desk", desk),
    );
    let mut run = orch.resume(&task_id).await.unwrap();
    assert_eq!(run.task().steps[0].status, StepStatus::Escalated);

    let report = expect_failed(orch.run(&mut run).await.unwrap());
    assert!(report.reason.contains("interrupted"));
    assert_eq!(healer.diagnosed(), 1);
    assert_eq!(run.task().steps[0].status, StepStatus::Abandoned);
}

#[tokio::test]
async fn test_completed_promotion_resumes_as_healed() {
    let dir = tempfile::tempdir().unwrap();
    let healer = FixedHealer::new(CandidatePatch::RestartOnly {
        backend_id: "desk".to_string(),
    });
    let desk = Arc::new(StuckRestart::default());
    let task_id = crash_during_promotion(promotion_config(dir.path()), healer.clone(), desk.clone()).await;

    desk.stuck.store(false, Ordering::SeqCst);
    // 治愈后的第一次规划时记下日志里的任务状态
    let current: Arc<OnceLock<Arc<StepOrchestrator>>> = Arc::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let calls = {
        let (current, seen, task_id) = (current.clone(), seen.clone(), task_id.clone());
        ScriptedCalls::new(move |step, _| {
            if let Some(orch) = current.get() {
                seen.lock().unwrap().push(orch.status(&task_id).unwrap().status);
            }
            proven_dir(step)
        })
    };
    let orch = orchestrator(
        ServicesBuilder::new(promotion_config(dir.path()))
            .with_step_planner(steps(&["create directory a"]))
            .with_call_planner(calls.clone())
            .with_healer(healer.clone())
            .with_builtin("desk", desk),
    );

    let _ = current.set(orch.clone());
    assert_eq!(orch.status(&task_id).unwrap().status, TaskStatus::Recovering);

    // 晋升在崩溃前已经生效
    let journal = &orch.services().journal;
    let task = journal.load_task(&task_id).unwrap().unwrap();
    let step = &task.steps[0];
    journal
        .record_recovery_event(&RecoveryEvent {
            task_id: task_id.clone(),
            epoch: task.epoch,
            step_id: step.id.clone(),
            escalation: step.escalations,
            session_id: "recovered".to_string(),
            stage: RecoveryStage::Promoted,
            detail: "restart desk".to_string(),
        })
        .unwrap();

    let mut run = orch.resume(&task_id).await.unwrap();
    let outcome = orch.run(&mut run).await.unwrap();
    assert!(matches!(outcome, TaskOutcome::Completed));
    assert_eq!(healer.diagnosed(), 1);
    let step = &run.task().steps[0];
    assert_eq!(step.heals_used, 1);
    assert_eq!(step.attempt_count, 1);
    assert_eq!(calls.planned(), 1);
    assert_eq!(*seen.lock().unwrap(), vec![TaskStatus::Active]);
}

#[tokio::test]
async fn test_abort_during_recovery_abandons_the_step() {
    let dir = tempfile::tempdir().unwrap();
    let entered = Arc::new(Notify::new());
    let orch = orchestrator(
        ServicesBuilder::new(base_config(dir.path()))
            .with_step_planner(steps(&["create directory a", "never reached"]))
            .with_call_planner(ScriptedCalls::new(|_, _| vec![make_dir("a")]))
            .with_healer(Arc::new(StuckHealer {
                entered: entered.clone(),
            })),
    );

    let mut run = orch.start_task("create a").await.unwrap();
    let task_id = run.task_id().to_string();
    let runner = orch.clone();
    let handle = tokio::spawn(async move {
        let outcome = runner.run(&mut run).await;
        (outcome, run)
    });

    entered.notified().await;
    assert!(orch.abort(&task_id));
    let (outcome, run) = handle.await.unwrap();
    assert!(matches!(outcome.unwrap(), TaskOutcome::Cancelled));
    assert_eq!(run.task().steps[0].status, StepStatus::Abandoned);
    assert_eq!(run.task().steps[1].status, StepStatus::Pending);

    let progress = orch.status(&task_id).unwrap();
    assert_eq!(progress.status, TaskStatus::Failed);
    assert_eq!(stages(&orch, &task_id).last().map(String::as_str), Some("abandoned"));
    assert!(!orch.abort("task_unknown"));
}
