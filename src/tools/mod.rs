pub mod echo;
pub mod executor;
pub mod filesystem;
pub mod registry;
pub mod schema;

pub use echo::EchoTool;
pub use executor::ToolExecutor;
pub use filesystem::{FileReadTool, FileWriteTool, SafeFs};
pub use registry::{Capability, RawOutput, Tool, ToolError, ToolRegistry};
pub use schema::DataType;

use std::path::Path;

/// 注册内置工具（file_write / file_read / echo），文件工具沙箱在 workspace 下
pub fn builtin_registry(workspace: impl AsRef<Path>) -> ToolRegistry {
    let fs = SafeFs::new(workspace);
    let mut registry = ToolRegistry::new();
    registry.register(FileWriteTool::new(fs.clone()));
    registry.register(FileReadTool::new(fs));
    registry.register(EchoTool);
    registry
}
