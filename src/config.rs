//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `STEWARD__*` 覆盖（双下划线表示嵌套，如 `STEWARD__LLM__PROVIDER=openai`）。

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tools::{RouteTable, ToolRoute, BUILTIN_BACKEND_ID};

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub orchestrator: OrchestratorSection,
    pub tools: ToolsSection,
    pub routing: RoutingSection,
    pub backends: Vec<BackendSection>,
    pub verification: VerificationSection,
    pub recovery: RecoverySection,
    pub llm: LlmSection,
}

/// [app] 段：应用名、状态目录
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 任务日志（journal.db）、快照、沙箱的根目录
    pub state_dir: PathBuf,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            state_dir: PathBuf::from("state"),
        }
    }
}

/// [orchestrator] 段：尝试预算、恢复预算、并发
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// 每个步骤的初始尝试预算
    pub max_attempts: u32,
    /// HEALED 后重新发放的尝试预算
    pub healed_max_attempts: u32,
    /// 每个步骤最多 HEALED 几次，超过直接 ABANDONED
    pub max_heals_per_step: u32,
    /// 单次尝试内并发工具调用上限
    pub max_concurrent_calls: usize,
    /// 快照中保留的叙述条数
    pub context_log_limit: usize,
    /// 重试时向调用参数注入 `_retry_context`
    pub inject_retry_context: bool,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            healed_max_attempts: 3,
            max_heals_per_step: 1,
            max_concurrent_calls: 4,
            context_log_limit: 50,
            inject_retry_context: true,
        }
    }
}

/// [tools] 段：超时、内置文件系统根
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用默认截止时间（秒）
    pub default_timeout_secs: u64,
    /// 按类别覆盖截止时间（秒）
    pub category_timeouts: HashMap<String, u64>,
    /// 后端重启期间分发方最多等待多久（秒）
    pub restart_lock_wait_secs: u64,
    /// 内置文件系统工具的根目录，未设置时用 ./workspace
    pub fs_root: Option<PathBuf>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            default_timeout_secs: 30,
            category_timeouts: HashMap::new(),
            restart_lock_wait_secs: 15,
            fs_root: None,
        }
    }
}

impl ToolsSection {
    pub fn timeout_for(&self, category: Option<&str>) -> Duration {
        let secs = category
            .and_then(|c| self.category_timeouts.get(c).copied())
            .unwrap_or(self.default_timeout_secs);
        Duration::from_secs(secs)
    }
}

/// [routing] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSection {
    /// 为 true 时自动加入内置工具路由（local 后端）
    pub builtin_routes: bool,
    pub routes: Vec<RouteSection>,
    /// 同义词组（组内任一名字都指向组内第一个有路由的别名）
    pub synonyms: Vec<Vec<String>>,
}

impl Default for RoutingSection {
    fn default() -> Self {
        Self {
            builtin_routes: true,
            routes: Vec::new(),
            synonyms: Vec::new(),
        }
    }
}

/// [[routing.routes]]
#[derive(Debug, Clone, Deserialize)]
pub struct RouteSection {
    pub alias: String,
    pub backend: String,
    pub tool: String,
    #[serde(default)]
    pub priority: i32,
    pub category: Option<String>,
}

impl RoutingSection {
    pub fn route_table(&self) -> RouteTable {
        let mut routes = if self.builtin_routes {
            crate::tools::builtin_routes()
        } else {
            Vec::new()
        };
        routes.extend(self.routes.iter().map(|r| {
            let mut route = ToolRoute::new(&r.alias, &r.backend, &r.tool).with_priority(r.priority);
            route.category = r.category.clone();
            route
        }));
        RouteTable::new(routes, self.synonyms.clone())
    }
}

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// 外部子进程，stdio 按行 JSON
    #[default]
    Process,
    /// 进程内后端
    Builtin,
}

/// [[backends]]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendSection {
    pub id: String,
    #[serde(default)]
    pub kind: BackendKind,
    /// 启动命令；args 为空时整行交给 sh -c
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// 允许恢复流水线修补的制品（文件或目录）
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// 沙箱复现命令（在沙箱目录执行，退出码 0 为通过）
    pub check_command: Option<String>,
}

impl BackendSection {
    pub fn builtin(id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind: BackendKind::Builtin,
            ..Self::default()
        }
    }
}

/// [verification] 段：证明类工具与效果类工具所需的证明
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VerificationSection {
    /// 观察类工具 -> 证明种类（如 list_dir = "listing"）
    pub proof_tools: HashMap<String, String>,
    /// 效果类工具 -> 需要的证明种类；两表都未列出的工具不能作为旁证
    pub required_proof: HashMap<String, String>,
}

impl Default for VerificationSection {
    fn default() -> Self {
        let proof_tools = [("list_dir", "listing"), ("read_file", "read-back"), ("echo", "echo")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let required_proof = [("make_dir", "listing"), ("write_file", "read-back")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            proof_tools,
            required_proof,
        }
    }
}

/// [recovery] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecoverySection {
    /// 每次 ESCALATED 最多几轮 诊断 -> 沙箱验证
    pub max_escalation_cycles: u32,
    /// 沙箱根目录，未设置时用 state_dir/sandbox
    pub sandbox_root: Option<PathBuf>,
    /// 沙箱复现命令超时（秒）
    pub check_timeout_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            max_escalation_cycles: 3,
            sandbox_root: None,
            check_timeout_secs: 120,
        }
    }
}

/// [llm] 段：规划 / 诊断所用模型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// mock / openai
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 单次请求超时（秒）
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            request_timeout_secs: 60,
        }
    }
}

impl AppConfig {
    pub fn fs_root(&self) -> PathBuf {
        self.tools
            .fs_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"))
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.recovery
            .sandbox_root
            .clone()
            .unwrap_or_else(|| self.app.state_dir.join("sandbox"))
    }

    /// 启动前校验：预算为正、路由指向已声明后端、进程后端有命令
    pub fn validate(&self) -> Result<(), String> {
        let o = &self.orchestrator;
        if o.max_attempts == 0 || o.healed_max_attempts == 0 {
            return Err("orchestrator attempt budgets must be at least 1".to_string());
        }
        if o.max_concurrent_calls == 0 {
            return Err("orchestrator.max_concurrent_calls must be at least 1".to_string());
        }
        if self.recovery.max_escalation_cycles == 0 {
            return Err("recovery.max_escalation_cycles must be at least 1".to_string());
        }
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                return Err("backend id must not be empty".to_string());
            }
            if backend.kind == BackendKind::Process
                && backend.command.as_deref().map(str::trim).unwrap_or("").is_empty()
            {
                return Err(format!("process backend '{}' has no command", backend.id));
            }
        }
        for route in &self.routing.routes {
            let known = route.backend == BUILTIN_BACKEND_ID || self.backends.iter().any(|b| b.id == route.backend);
            if !known {
                return Err(format!(
                    "route '{}' points at undeclared backend '{}'",
                    route.alias, route.backend
                ));
            }
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 STEWARD__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 STEWARD__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("STEWARD")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
