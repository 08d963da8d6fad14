//! Steward 命令行入口
//!
//! steward run "<objective>" | steward resume | steward status <task_id>
//! run 与 resume 启动时都会先续跑日志中未完成的任务。
//! Ctrl+C / SIGTERM：取消运行中的任务（状态已落盘，可 resume），再停止后端。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;
use steward::config::{load_config, AppConfig};
use steward::core::shutdown::{run_with_graceful_shutdown, BackendCleanup, TaskCancelCleanup};
use steward::core::{ShutdownCoordinator, ShutdownManager};
use steward::{ServicesBuilder, StepOrchestrator, TaskOutcome, TaskRun};

#[derive(Parser, Debug)]
#[command(name = "steward")]
#[command(about = "Multi-step task orchestrator with evidence-gated steps and self-healing recovery")]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 规划并执行一个新目标
    Run { objective: String },
    /// 续跑所有未完成的任务
    Resume,
    /// 查看任务进度
    Status { task_id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    steward::observability::init();
    let cli = Cli::parse();

    let config = load_config(cli.config.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let shutdown = Arc::new(ShutdownManager::new());
    let services = Arc::new(
        ServicesBuilder::new(config)
            .with_shutdown_token(shutdown.token())
            .build()
            .context("Failed to build services")?,
    );
    let orchestrator = Arc::new(StepOrchestrator::new(services.clone()));

    if let Command::Status { task_id } = &cli.command {
        let progress = orchestrator.status(task_id).context("Failed to load task")?;
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }

    let mut coordinator = ShutdownCoordinator::new(shutdown.clone());
    coordinator.register(TaskCancelCleanup::new(services.tasks.clone()));
    coordinator.register(BackendCleanup::new(services.supervisor.clone()));

    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                tracing::debug!(event = %line, "progress");
            }
        }
    });

    let app = async {
        let result = match cli.command {
            Command::Run { objective } => run_objective(&orchestrator, &objective).await,
            Command::Resume => resume_unfinished(&orchestrator).await,
            Command::Status { .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!("{:#}", e);
            eprintln!("error: {e:#}");
        }
    };

    run_with_graceful_shutdown(shutdown, app, || async { coordinator.run_cleanup().await }).await;
    Ok(())
}

async fn run_objective(orchestrator: &Arc<StepOrchestrator>, objective: &str) -> anyhow::Result<()> {
    let unfinished = spawn_unfinished(orchestrator).await?;
    if !unfinished.is_empty() {
        println!("resuming {} unfinished task(s)", unfinished.len());
    }

    let result = async {
        let mut run = orchestrator
            .start_task(objective)
            .await
            .context("Failed to start task")?;
        println!("task {} accepted with {} steps", run.task_id(), run.task().steps.len());
        drive(orchestrator, &mut run).await
    }
    .await;

    join_runs(unfinished).await?;
    result
}

async fn resume_unfinished(orchestrator: &Arc<StepOrchestrator>) -> anyhow::Result<()> {
    let handles = spawn_unfinished(orchestrator).await?;
    if handles.is_empty() {
        println!("nothing to resume");
        return Ok(());
    }
    join_runs(handles).await
}

/// 日志中每个 ACTIVE / RECOVERING 任务各起一个驱动
async fn spawn_unfinished(
    orchestrator: &Arc<StepOrchestrator>,
) -> anyhow::Result<Vec<JoinHandle<anyhow::Result<()>>>> {
    let runs = orchestrator.resume_all().await.context("Failed to read the task journal")?;
    let mut handles = Vec::with_capacity(runs.len());
    for mut run in runs {
        for warning in run.warnings() {
            println!("warning: {warning}");
        }
        let orchestrator = orchestrator.clone();
        handles.push(tokio::spawn(async move { drive(&orchestrator, &mut run).await }));
    }
    Ok(handles)
}

async fn join_runs(handles: Vec<JoinHandle<anyhow::Result<()>>>) -> anyhow::Result<()> {
    for handle in handles {
        handle.await.context("Task runner panicked")??;
    }
    Ok(())
}

async fn drive(orchestrator: &StepOrchestrator, run: &mut TaskRun) -> anyhow::Result<()> {
    let outcome = orchestrator.run(run).await.context("Task run failed")?;
    match outcome {
        TaskOutcome::Completed => println!("task {} completed", run.task_id()),
        TaskOutcome::Failed(report) => {
            println!("task {} failed at step {}: {}", run.task_id(), report.ordinal, report.reason);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        TaskOutcome::Cancelled => println!("task {} cancelled", run.task_id()),
        TaskOutcome::StepApproved { .. } => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use steward::task::TaskStatus;

    #[tokio::test]
    async fn test_unfinished_tasks_are_driven_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.app.state_dir = dir.path().join("state");
        config.tools.fs_root = Some(dir.path().join("ws"));
        let services = Arc::new(ServicesBuilder::new(config).build().unwrap());
        let orchestrator = Arc::new(StepOrchestrator::new(services));

        // 上次进程接受了任务但没来得及驱动
        let left_over = orchestrator.start_task("say hello").await.unwrap();
        let task_id = left_over.task_id().to_string();
        drop(left_over);

        let handles = spawn_unfinished(&orchestrator).await.unwrap();
        assert_eq!(handles.len(), 1);
        join_runs(handles).await.unwrap();
        assert_eq!(orchestrator.status(&task_id).unwrap().status, TaskStatus::Completed);
        assert!(spawn_unfinished(&orchestrator).await.unwrap().is_empty());
    }
}
