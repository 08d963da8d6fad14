//! 工具层：协议与归一化、路由表、路由器、内置工具

pub mod echo;
pub mod filesystem;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod routes;
pub mod schema;

use std::path::Path;

pub use echo::EchoTool;
pub use filesystem::{ListDirTool, MakeDirTool, ReadFileTool, SafeFs, WriteFileTool};
pub use protocol::{normalize_response, Backend, ToolRequest};
pub use registry::{Tool, ToolRegistry};
pub use router::{BackendLock, ToolRouter};
pub use routes::{CanonicalTarget, RouteTable, ToolRoute};
pub use schema::{planned_call_schema_json, tool_request_schema_json};

/// 内置后端的默认 ID
pub const BUILTIN_BACKEND_ID: &str = "local";

/// 内置工具集：echo + 四个文件系统工具，根目录为 fs_root
pub fn builtin_registry(fs_root: impl AsRef<Path>) -> ToolRegistry {
    let fs = SafeFs::new(fs_root);
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(ListDirTool::new(fs.clone()));
    registry.register(ReadFileTool::new(fs.clone()));
    registry.register(MakeDirTool::new(fs.clone()));
    registry.register(WriteFileTool::new(fs));
    registry
}

/// 内置工具的默认路由（别名 = 工具名，类别 fs / util）
pub fn builtin_routes() -> Vec<ToolRoute> {
    vec![
        ToolRoute::new("echo", BUILTIN_BACKEND_ID, "echo").with_category("util"),
        ToolRoute::new("list_dir", BUILTIN_BACKEND_ID, "list_dir").with_category("fs"),
        ToolRoute::new("read_file", BUILTIN_BACKEND_ID, "read_file").with_category("fs"),
        ToolRoute::new("make_dir", BUILTIN_BACKEND_ID, "make_dir").with_category("fs"),
        ToolRoute::new("write_file", BUILTIN_BACKEND_ID, "write_file").with_category("fs"),
    ]
}
