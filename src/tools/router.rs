//! 工具路由器：别名解析 + 有界分发 + 审计
//!
//! 每次 dispatch 恰好产生一条 ToolInvocationRecord（OK / ERROR / TIMEOUT），从不向上抛错；
//! 后端重启/晋升期间持有该后端的独占锁，分发方在 min(restart_lock_wait, 截止时间) 内等待，
//! 超出即记为 TIMEOUT。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tokio::time::{timeout, Instant};

use crate::core::error::ResolutionError;
use crate::supervisor::ProcessControl;
use crate::task::{Arguments, InvocationStatus, PlannedCall, ResultEnvelope, ToolInvocationRecord};
use crate::tools::protocol::{codes, normalize_response, ToolRequest};
use crate::tools::routes::{CanonicalTarget, RouteTable};

/// 某后端的独占锁（晋升/重启期间持有）
pub struct BackendLock {
    backend_id: String,
    _guard: OwnedRwLockWriteGuard<()>,
}

impl BackendLock {
    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }
}

enum Exchange {
    Response(ResultEnvelope),
    Timeout(String),
    Failed(String, String),
}

/// 路由器
pub struct ToolRouter {
    table: StdRwLock<Arc<RouteTable>>,
    backends: Arc<dyn ProcessControl>,
    locks: StdMutex<HashMap<String, Arc<RwLock<()>>>>,
    restart_lock_wait: Duration,
}

impl ToolRouter {
    pub fn new(table: RouteTable, backends: Arc<dyn ProcessControl>, restart_lock_wait: Duration) -> Self {
        Self {
            table: StdRwLock::new(Arc::new(table)),
            backends,
            locks: StdMutex::new(HashMap::new()),
            restart_lock_wait,
        }
    }

    /// 当前路由表快照
    pub fn routes(&self) -> Arc<RouteTable> {
        match self.table.read() {
            Ok(table) => table.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn backends(&self) -> &Arc<dyn ProcessControl> {
        &self.backends
    }

    pub fn resolve(&self, alias: &str, category: Option<&str>) -> Result<CanonicalTarget, ResolutionError> {
        self.routes().resolve(alias, category)
    }

    /// 解析并分发；解析失败直接产生 ERROR 记录
    pub async fn call(&self, call: &PlannedCall, deadline: Duration) -> ToolInvocationRecord {
        match self.resolve(&call.alias, call.category.as_deref()) {
            Ok(target) => self.dispatch(&call.alias, &target, call.arguments.clone(), deadline).await,
            Err(e) => {
                tracing::warn!(alias = %call.alias, error = %e, "Tool alias resolution failed");
                let record = ToolInvocationRecord {
                    requested_alias: call.alias.clone(),
                    resolved_target: None,
                    arguments: call.arguments.clone(),
                    result: ResultEnvelope::failure(codes::RESOLUTION_ERROR, e.to_string()),
                    status: InvocationStatus::Error,
                    attempt: 0,
                    heal_round: 0,
                    correlation_id: new_correlation_id(),
                    duration_ms: 0,
                    timestamp: Utc::now(),
                };
                audit(&record);
                record
            }
        }
    }

    /// 向已解析目标发起一次有界调用
    pub async fn dispatch(
        &self,
        alias: &str,
        target: &CanonicalTarget,
        arguments: Arguments,
        deadline: Duration,
    ) -> ToolInvocationRecord {
        let started = Instant::now();
        let correlation_id = new_correlation_id();
        let exchange = self.exchange(target, &arguments, &correlation_id, deadline).await;

        let (status, result) = match exchange {
            Exchange::Response(envelope) if envelope.ok => (InvocationStatus::Ok, envelope),
            Exchange::Response(envelope) => (InvocationStatus::Error, envelope),
            Exchange::Timeout(message) => (
                InvocationStatus::Timeout,
                ResultEnvelope::failure(codes::TIMEOUT, message),
            ),
            Exchange::Failed(code, message) => (InvocationStatus::Error, ResultEnvelope::failure(code, message)),
        };

        let record = ToolInvocationRecord {
            requested_alias: alias.to_string(),
            resolved_target: Some(target.clone()),
            arguments,
            result,
            status,
            attempt: 0,
            heal_round: 0,
            correlation_id,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        };
        audit(&record);
        record
    }

    async fn exchange(
        &self,
        target: &CanonicalTarget,
        arguments: &Arguments,
        correlation_id: &str,
        deadline: Duration,
    ) -> Exchange {
        let deadline_at = Instant::now() + deadline;

        let lock = self.backend_lock(&target.backend_id);
        let lock_wait = self.restart_lock_wait.min(deadline);
        let _read = match timeout(lock_wait, lock.read_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                return Exchange::Timeout(format!(
                    "backend '{}' is restarting; gave up after {}ms",
                    target.backend_id,
                    lock_wait.as_millis()
                ))
            }
        };

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let connection = match timeout(remaining, self.backends.connection(&target.backend_id)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Exchange::Failed(codes::BACKEND_UNAVAILABLE.to_string(), e.to_string()),
            Err(_) => return Exchange::Timeout(format!("backend '{}' did not become ready", target.backend_id)),
        };

        let remaining = deadline_at.saturating_duration_since(Instant::now());
        let request = ToolRequest {
            tool_id: target.tool_id.clone(),
            arguments: arguments.clone(),
            correlation_id: correlation_id.to_string(),
            deadline_ms: remaining.as_millis() as u64,
        };
        match timeout(remaining, connection.call(request)).await {
            Ok(Ok(raw)) => Exchange::Response(normalize_response(raw)),
            Ok(Err(message)) => Exchange::Failed(codes::TRANSPORT_ERROR.to_string(), message),
            Err(_) => Exchange::Timeout(format!(
                "{} gave no response within {}ms",
                target,
                deadline.as_millis()
            )),
        }
    }

    fn backend_lock(&self, backend_id: &str) -> Arc<RwLock<()>> {
        let mut locks = match self.locks.lock() {
            Ok(l) => l,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// 独占某后端：等待进行中的分发结束，新分发在锁释放前阻塞
    pub async fn lock_backend(&self, backend_id: &str) -> BackendLock {
        let guard = self.backend_lock(backend_id).write_owned().await;
        BackendLock {
            backend_id: backend_id.to_string(),
            _guard: guard,
        }
    }

    /// 原子替换路由表（须持有受影响后端的锁）
    pub fn swap_routes(&self, lock: &BackendLock, update: impl FnOnce(&RouteTable) -> RouteTable) {
        let mut table = match self.table.write() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        let next = update(&**table);
        *table = Arc::new(next);
        tracing::info!(backend = %lock.backend_id(), "Route table replaced");
    }

    /// 在独占锁内重启后端
    pub async fn restart_backend(&self, backend_id: &str) -> Result<(), crate::supervisor::SupervisorError> {
        let _lock = self.lock_backend(backend_id).await;
        self.backends.restart(backend_id).await
    }
}

fn new_correlation_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4())
}

fn audit(record: &ToolInvocationRecord) {
    let audit = serde_json::json!({
        "event": "tool_audit",
        "alias": record.requested_alias,
        "target": record.resolved_target.as_ref().map(|t| t.to_string()),
        "status": record.status,
        "error_code": record.result.error.as_ref().map(|e| e.code.clone()),
        "duration_ms": record.duration_ms,
        "correlation_id": record.correlation_id,
        "args_preview": args_preview(&record.arguments),
    });
    tracing::info!(audit = %audit.to_string(), "tool");
}

fn args_preview(args: &Arguments) -> String {
    let s = serde_json::Value::Object(args.clone()).to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
