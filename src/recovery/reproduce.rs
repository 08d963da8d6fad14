//! 沙箱复现：在沙箱中验证补丁确实修好了失败
//!
//! 判定规则：
//! - reroute：用沙箱路由表重新解析上一次尝试中失败的调用，逐个重放到新目标，必须全部成功；
//!   至少一条重放落在新目标上
//! - 制品补丁：后端必须配置 check_command，在沙箱目录执行且退出码为 0
//! - restart_only：重置后端后重放落在该后端上的失败调用，必须全部成功
//!
//! 重放直接走监管器连接，每次调用以 check_timeout 为截止时间。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::recovery::{CandidatePatch, Sandbox};
use crate::supervisor::{shell_command, ProcessControl};
use crate::task::{Step, ToolInvocationRecord};
use crate::tools::protocol::{normalize_response, ToolRequest};
use crate::tools::CanonicalTarget;

#[async_trait]
pub trait Reproducer: Send + Sync {
    /// Ok(()) 为 PASS，Err(原因) 为 FAIL
    async fn reproduce(&self, sandbox: &Sandbox, patch: &CandidatePatch, step: &Step) -> Result<(), String>;
}

pub struct SandboxReproducer {
    backends: Arc<dyn ProcessControl>,
    check_timeout: Duration,
}

impl SandboxReproducer {
    pub fn new(backends: Arc<dyn ProcessControl>, check_timeout: Duration) -> Self {
        Self {
            backends,
            check_timeout,
        }
    }

    async fn run_check(&self, sandbox: &Sandbox, backend_id: &str) -> Result<(), String> {
        let spec = self
            .backends
            .spec(backend_id)
            .ok_or_else(|| format!("unknown backend '{backend_id}'"))?;
        let Some(check) = spec.check_command.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Err(format!(
                "backend '{backend_id}' has no check_command; artifact patches cannot be verified"
            ));
        };
        let artifact = sandbox
            .artifact()
            .map(|a| a.sandboxed.to_string_lossy().to_string())
            .unwrap_or_default();
        let command_text = check
            .replace("{sandbox}", &sandbox.path().to_string_lossy())
            .replace("{artifact}", &artifact);

        let mut command = shell_command(&command_text);
        command.current_dir(sandbox.path()).kill_on_drop(true);
        let output = tokio::time::timeout(self.check_timeout, command.output())
            .await
            .map_err(|_| format!("check command timed out after {}s", self.check_timeout.as_secs()))?
            .map_err(|e| format!("check command failed to run: {e}"))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!(
                "check command exited with {}: {}",
                output.status,
                stderr.trim()
            ))
        }
    }

    /// 向目标重放一次调用，结果必须为 OK
    async fn replay(&self, record: &ToolInvocationRecord, target: &CanonicalTarget) -> Result<(), String> {
        let alias = &record.requested_alias;
        let connection = tokio::time::timeout(self.check_timeout, self.backends.connection(&target.backend_id))
            .await
            .map_err(|_| format!("{target} did not become ready for '{alias}'"))?
            .map_err(|e| e.to_string())?;
        let request = ToolRequest {
            tool_id: target.tool_id.clone(),
            arguments: record.arguments.clone(),
            correlation_id: format!("repro_{}", uuid::Uuid::new_v4()),
            deadline_ms: self.check_timeout.as_millis() as u64,
        };
        let raw = tokio::time::timeout(self.check_timeout, connection.call(request))
            .await
            .map_err(|_| format!("'{alias}' timed out again on {target}"))??;
        let envelope = normalize_response(raw);
        match envelope.error {
            None if envelope.ok => {
                tracing::debug!(alias = %alias, target = %target, "Reproduction call passed");
                Ok(())
            }
            Some(err) => Err(format!("'{alias}' still fails on {target}: {}: {}", err.code, err.message)),
            None => Err(format!("'{alias}' still fails on {target}")),
        }
    }

    async fn replay_reroute(&self, sandbox: &Sandbox, route_target: &CanonicalTarget, step: &Step) -> Result<(), String> {
        let mut exercised = false;
        for record in failed_calls(step) {
            let target = sandbox
                .routes()
                .resolve(&record.requested_alias, None)
                .map_err(|_| format!("'{}' still does not resolve", record.requested_alias))?;
            exercised |= target == *route_target;
            self.replay(record, &target).await?;
        }
        if exercised {
            Ok(())
        } else {
            Err(format!("no failed call of the step reaches {route_target}"))
        }
    }

    async fn replay_restart(&self, backend_id: &str, step: &Step) -> Result<(), String> {
        let affected: Vec<(&ToolInvocationRecord, &CanonicalTarget)> = failed_calls(step)
            .into_iter()
            .filter_map(|r| r.resolved_target.as_ref().map(|t| (r, t)))
            .filter(|(_, t)| t.backend_id == backend_id)
            .collect();
        if affected.is_empty() {
            return Err(format!("no failed call of the step ran on backend '{backend_id}'"));
        }
        let connection = self.backends.connection(backend_id).await.map_err(|e| e.to_string())?;
        tokio::time::timeout(self.check_timeout, connection.reset())
            .await
            .map_err(|_| format!("backend '{backend_id}' reset timed out"))?
            .map_err(|e| format!("backend '{backend_id}' reset failed: {e}"))?;
        for (record, target) in affected {
            self.replay(record, target).await?;
        }
        Ok(())
    }
}

/// 上一次尝试中失败的调用（按别名 + 参数去重）
fn failed_calls(step: &Step) -> Vec<&ToolInvocationRecord> {
    let mut seen = HashSet::new();
    step.evidence
        .iter()
        .filter(|r| r.attempt == step.attempt_count && r.heal_round == step.heals_used && !r.is_ok())
        .filter(|r| seen.insert((r.requested_alias.clone(), serde_json::Value::Object(r.arguments.clone()).to_string())))
        .collect()
}

#[async_trait]
impl Reproducer for SandboxReproducer {
    async fn reproduce(&self, sandbox: &Sandbox, patch: &CandidatePatch, step: &Step) -> Result<(), String> {
        match patch {
            CandidatePatch::Reroute { route } => {
                if !self.backends.is_known(&route.target.backend_id) {
                    return Err(format!("reroute target backend '{}' is unknown", route.target.backend_id));
                }
                let resolved = sandbox
                    .routes()
                    .resolve(&route.alias, route.category.as_deref())
                    .map_err(|e| e.to_string())?;
                if resolved != route.target {
                    return Err(format!(
                        "'{}' still resolves to {} in the sandbox",
                        route.alias, resolved
                    ));
                }
                self.replay_reroute(sandbox, &route.target, step).await
            }
            CandidatePatch::EditArtifact { backend_id, .. } | CandidatePatch::ReplaceArtifact { backend_id, .. } => {
                self.run_check(sandbox, backend_id).await
            }
            CandidatePatch::RestartOnly { backend_id } => {
                if !self.backends.is_known(backend_id) {
                    return Err(format!("backend '{backend_id}' is unknown"));
                }
                self.replay_restart(backend_id, step).await
            }
        }
    }
}
