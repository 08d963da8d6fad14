//! Steward - 多步骤任务编排器
//!
//! 模块划分：
//! - **collab**: 规划器与诊断器（协作方接口 + LLM 实现）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 状态机、主控循环、状态投影、任务监管、调用调度、关停
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock）
//! - **observability**: 日志初始化
//! - **recovery**: 自愈恢复（诊断、沙箱复现、晋升）
//! - **store**: 任务日志（SQLite）与恢复快照
//! - **supervisor**: 后端进程监管与 stdio 传输
//! - **task**: 任务数据模型
//! - **tools**: 工具协议、路由表、路由器、内置工具
//! - **verify**: 证据校验门

pub mod collab;
pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod recovery;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod tools;
pub mod verify;

pub use crate::core::{ServicesBuilder, StepOrchestrator, TaskRun};
pub use crate::task::{Task, TaskOutcome};
