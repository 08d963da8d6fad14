//! 核心编排层：错误、状态机、状态投影、任务监管、调用调度、关停、服务装配、主控循环

pub mod builder;
pub mod error;
pub mod orchestrator;
pub mod shutdown;
pub mod state;
pub mod task_scheduler;
pub mod task_supervisor;
pub mod transitions;

pub use builder::{OrchestratorSettings, Services, ServicesBuilder};
pub use error::{OrchestratorError, ResolutionError, ToolError};
pub use orchestrator::{StepOrchestrator, TaskRun};
pub use shutdown::{ShutdownCoordinator, ShutdownManager, ShutdownReason};
pub use state::{ProgressBus, ProgressEvent, StepProgress, TaskProgress};
pub use task_scheduler::TaskScheduler;
pub use task_supervisor::TaskSupervisor;
pub use transitions::{Transition, EDGES};
