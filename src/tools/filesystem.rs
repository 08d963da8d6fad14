//! 内置文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径必须落在 root 下（禁止 ../ 逃逸）；
//! list_dir / read_file 是观察类工具（证明），make_dir / write_file 是效果类工具（声明）。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::tools::Tool;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Path escape attempt: {0}")]
    PathEscape(String),

    #[error("{op} failed: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// 沙箱文件系统
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 已存在路径：canonicalize 后必须在 root 下
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let rel = path.trim_start_matches("./");
        let full = self.root_dir.join(rel);
        let canonical = full
            .canonicalize()
            .map_err(|_| FsError::NotFound(rel.to_string()))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(FsError::PathEscape(rel.to_string()))
        }
    }

    /// 待创建路径：只允许普通路径分量，不允许绝对路径与 ..
    pub fn resolve_new(&self, path: &str) -> Result<PathBuf, FsError> {
        let rel = Path::new(path.trim_start_matches("./"));
        if rel.as_os_str().is_empty() {
            return Err(FsError::PathEscape(path.to_string()));
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(FsError::PathEscape(path.to_string())),
            }
        }
        Ok(self.root_dir.join(rel))
    }

    pub fn read_file(&self, path: &str) -> Result<String, FsError> {
        let resolved = self.resolve(path)?;
        std::fs::read_to_string(&resolved).map_err(|source| FsError::Io { op: "Read", source })
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let base = if path.is_empty() || path == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        let mut entries = Vec::new();
        let read = std::fs::read_dir(&base).map_err(|source| FsError::Io { op: "List", source })?;
        for entry in read {
            let entry = entry.map_err(|source| FsError::Io { op: "List", source })?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let suffix = if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                "/"
            } else {
                ""
            };
            entries.push(format!("{}{}", name, suffix));
        }
        entries.sort();
        Ok(entries)
    }

    pub fn make_dir(&self, path: &str) -> Result<PathBuf, FsError> {
        let target = self.resolve_new(path)?;
        std::fs::create_dir_all(&target).map_err(|source| FsError::Io { op: "Create dir", source })?;
        Ok(target)
    }

    pub fn write_file(&self, path: &str, content: &str) -> Result<usize, FsError> {
        let target = self.resolve_new(path)?;
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|source| FsError::Io { op: "Create dir", source })?;
        }
        std::fs::write(&target, content).map_err(|source| FsError::Io { op: "Write", source })?;
        Ok(content.len())
    }
}

fn path_arg(args: &Value, default: Option<&str>) -> Result<String, String> {
    match args.get("path").and_then(|v| v.as_str()) {
        Some(p) => Ok(p.to_string()),
        None => default
            .map(str::to_string)
            .ok_or_else(|| "missing 'path' argument".to_string()),
    }
}

/// 列目录（观察类：listing 证明）
pub struct ListDirTool {
    fs: SafeFs,
}

impl ListDirTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }

    fn description(&self) -> &str {
        "List directory entries (dirs end with '/'). Args: {\"path\": \"directory, default '.'\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = path_arg(&args, Some("."))?;
        tracing::debug!(path = %path, "list_dir");
        let entries = self.fs.list_dir(&path).map_err(|e| e.to_string())?;
        Ok(json!(entries))
    }
}

/// 读文件（观察类：read-back 证明）
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read file contents. Args: {\"path\": \"file path relative to workspace\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = path_arg(&args, None)?;
        tracing::debug!(path = %path, "read_file");
        let content = self.fs.read_file(&path).map_err(|e| e.to_string())?;
        Ok(Value::String(content))
    }
}

/// 建目录（效果类）
pub struct MakeDirTool {
    fs: SafeFs,
}

impl MakeDirTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for MakeDirTool {
    fn name(&self) -> &str {
        "make_dir"
    }

    fn description(&self) -> &str {
        "Create a directory (and parents). Args: {\"path\": \"directory path\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = path_arg(&args, None)?;
        tracing::debug!(path = %path, "make_dir");
        self.fs.make_dir(&path).map_err(|e| e.to_string())?;
        Ok(json!({ "created": path }))
    }
}

/// 写文件（效果类）
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write a file, replacing it if present. Args: {\"path\": \"file path\", \"content\": \"text\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let path = path_arg(&args, None)?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "missing 'content' argument".to_string())?;
        let bytes = self.fs.write_file(&path, content).map_err(|e| e.to_string())?;
        Ok(json!({ "written": path, "bytes": bytes }))
    }
}
