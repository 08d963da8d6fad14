//! 沙箱工作区：补丁先在这里应用与复现，绝不直接碰线上路由与制品
//!
//! 布局：<sandbox_root>/<sandbox_id>/
//!   routes.toml          当前路由表副本（reroute 补丁作用于它）
//!   artifacts/<n>/...    受影响后端的制品副本

use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::config::BackendSection;
use crate::recovery::CandidatePatch;
use crate::tools::RouteTable;

/// 线上制品路径 -> 沙箱副本路径
#[derive(Debug, Clone)]
pub struct ArtifactMapping {
    pub live: PathBuf,
    pub sandboxed: PathBuf,
}

pub struct Sandbox {
    id: String,
    root: PathBuf,
    routes: RouteTable,
    artifact: Option<ArtifactMapping>,
}

impl Sandbox {
    /// 为补丁建立隔离副本
    pub fn isolate(
        sandbox_root: &Path,
        patch: &CandidatePatch,
        live_routes: &RouteTable,
        spec: Option<&BackendSection>,
    ) -> Result<Self, String> {
        let id = format!("sbx_{}", uuid::Uuid::new_v4().simple());
        let root = sandbox_root.join(&id);
        fs::create_dir_all(&root).map_err(|e| format!("create sandbox {}: {}", root.display(), e))?;

        let mut sandbox = Self {
            id,
            root,
            routes: live_routes.clone(),
            artifact: None,
        };
        sandbox.write_routes()?;

        if let Some(path) = artifact_path(patch) {
            let spec = spec.ok_or_else(|| format!("unknown backend '{}'", patch.backend_id()))?;
            let (declared, index, relative) = locate_artifact(spec, path)?;
            let copy_root = sandbox.root.join("artifacts").join(index.to_string());
            let name = declared
                .file_name()
                .ok_or_else(|| format!("artifact {} has no file name", declared.display()))?;
            let dest = copy_root.join(name);
            copy_tree(&declared, &dest)?;
            let sandboxed = match relative {
                Some(rel) => dest.join(rel),
                None => dest,
            };
            sandbox.artifact = Some(ArtifactMapping {
                live: PathBuf::from(path),
                sandboxed,
            });
        }
        Ok(sandbox)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn artifact(&self) -> Option<&ArtifactMapping> {
        self.artifact.as_ref()
    }

    /// 在沙箱副本上应用补丁
    pub fn apply(&mut self, patch: &CandidatePatch) -> Result<(), String> {
        match patch {
            CandidatePatch::Reroute { route } => {
                self.routes = self.routes.with_route(route.clone());
                self.write_routes()
            }
            CandidatePatch::EditArtifact { find, replace, .. } => {
                let target = self.artifact_target()?;
                let updated = edit_text(&target, find, replace)?;
                fs::write(&target, updated).map_err(|e| format!("write {}: {}", target.display(), e))
            }
            CandidatePatch::ReplaceArtifact { content, .. } => {
                let target = self.artifact_target()?;
                fs::write(&target, content).map_err(|e| format!("write {}: {}", target.display(), e))
            }
            CandidatePatch::RestartOnly { .. } => Ok(()),
        }
    }

    fn artifact_target(&self) -> Result<PathBuf, String> {
        self.artifact
            .as_ref()
            .map(|a| a.sandboxed.clone())
            .ok_or_else(|| "patch targets an artifact that was not isolated".to_string())
    }

    fn write_routes(&self) -> Result<(), String> {
        let raw = self.routes.to_toml().map_err(|e| e.to_string())?;
        fs::write(self.root.join("routes.toml"), raw).map_err(|e| e.to_string())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.root) {
            tracing::debug!(sandbox = %self.id, error = %e, "Sandbox cleanup failed");
        }
    }
}

fn artifact_path(patch: &CandidatePatch) -> Option<&str> {
    match patch {
        CandidatePatch::EditArtifact { path, .. } | CandidatePatch::ReplaceArtifact { path, .. } => Some(path.as_str()),
        _ => None,
    }
}

/// 补丁路径必须是声明的制品，或位于声明的制品目录内
pub fn locate_artifact(spec: &BackendSection, path: &str) -> Result<(PathBuf, usize, Option<PathBuf>), String> {
    let wanted = Path::new(path);
    for (index, declared) in spec.artifacts.iter().enumerate() {
        if wanted == declared.as_path() {
            return Ok((declared.clone(), index, None));
        }
        if declared.is_dir() {
            if let Ok(rel) = wanted.strip_prefix(declared) {
                let escapes = rel
                    .components()
                    .any(|c| !matches!(c, std::path::Component::Normal(_)));
                if !escapes && !rel.as_os_str().is_empty() {
                    return Ok((declared.clone(), index, Some(rel.to_path_buf())));
                }
            }
        }
    }
    Err(format!(
        "'{}' is not a declared artifact of backend '{}'",
        path, spec.id
    ))
}

/// 字符串替换（只替换第一处）；找不到 find 视为补丁不适用
pub fn edit_text(path: &Path, find: &str, replace: &str) -> Result<String, String> {
    if find.is_empty() {
        return Err("edit patch has an empty 'find' string".to_string());
    }
    let text = fs::read_to_string(path).map_err(|e| format!("read {}: {}", path.display(), e))?;
    if !text.contains(find) {
        return Err(format!("'{}' not found in {}", find, path.display()));
    }
    Ok(text.replacen(find, replace, 1))
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), String> {
    if from.is_file() {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        fs::copy(from, to).map_err(|e| format!("copy {}: {}", from.display(), e))?;
        return Ok(());
    }
    if !from.is_dir() {
        return Err(format!("artifact {} does not exist", from.display()));
    }
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(|e| e.to_string())?;
        let rel = entry.path().strip_prefix(from).map_err(|e| e.to_string())?;
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| e.to_string())?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &dest).map_err(|e| format!("copy {}: {}", entry.path().display(), e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRoute;

    fn spec_with(artifacts: Vec<PathBuf>) -> BackendSection {
        BackendSection {
            id: "desk".into(),
            command: Some("desk --stdio".into()),
            artifacts,
            ..BackendSection::default()
        }
    }

    #[test]
    fn test_edit_applies_to_copy_only() {
        let live = tempfile::tempdir().unwrap();
        let file = live.path().join("tools.json");
        fs::write(&file, r#"{"list": "ls -1"}"#).unwrap();
        let root = tempfile::tempdir().unwrap();
        let patch = CandidatePatch::EditArtifact {
            backend_id: "desk".into(),
            path: file.to_string_lossy().to_string(),
            find: "ls -1".into(),
            replace: "ls -1a".into(),
        };
        let spec = spec_with(vec![file.clone()]);
        let mut sandbox = Sandbox::isolate(root.path(), &patch, &RouteTable::default(), Some(&spec)).unwrap();
        sandbox.apply(&patch).unwrap();
        let copy = sandbox.artifact().unwrap().sandboxed.clone();
        assert!(fs::read_to_string(&copy).unwrap().contains("ls -1a"));
        assert!(!fs::read_to_string(&file).unwrap().contains("ls -1a"));
        let sandbox_dir = sandbox.path().to_path_buf();
        drop(sandbox);
        assert!(!sandbox_dir.exists());
    }

    #[test]
    fn test_file_inside_declared_directory() {
        let live = tempfile::tempdir().unwrap();
        fs::create_dir_all(live.path().join("conf")).unwrap();
        fs::write(live.path().join("conf/a.toml"), "x = 1").unwrap();
        let spec = spec_with(vec![live.path().to_path_buf()]);
        let path = live.path().join("conf/a.toml");
        let (_, index, rel) = locate_artifact(&spec, &path.to_string_lossy()).unwrap();
        assert_eq!(index, 0);
        assert_eq!(rel.unwrap(), PathBuf::from("conf/a.toml"));
        assert!(locate_artifact(&spec, "/etc/passwd").is_err());
    }

    #[test]
    fn test_reroute_changes_sandbox_routes_only() {
        let root = tempfile::tempdir().unwrap();
        let live = RouteTable::new(vec![ToolRoute::new("list_dir", "local", "list_dir")], vec![]);
        let patch = CandidatePatch::Reroute {
            route: ToolRoute::new("list_dir", "desk", "ls"),
        };
        let mut sandbox = Sandbox::isolate(root.path(), &patch, &live, None).unwrap();
        sandbox.apply(&patch).unwrap();
        assert_eq!(sandbox.routes().resolve("list_dir", None).unwrap().backend_id, "desk");
        assert_eq!(live.resolve("list_dir", None).unwrap().backend_id, "local");
        assert!(sandbox.path().join("routes.toml").exists());
    }

    #[test]
    fn test_missing_find_string_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        fs::write(&file, "abc").unwrap();
        assert!(edit_text(&file, "zzz", "y").is_err());
        assert!(edit_text(&file, "", "y").is_err());
        assert_eq!(edit_text(&file, "b", "B").unwrap(), "aBc");
    }
}
