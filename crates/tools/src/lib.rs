//! Built-in tools: exec/process session management, workspace-scoped file
//! I/O, and the generic tool registry and invocation contract that wraps
//! every call with hook emission and panic-free error capture.

pub mod adapters;
pub mod exec;
pub mod file_ops;
pub mod manager;
pub mod process;
pub mod registry;

pub use adapters::{
    ExecTool, FileAppendTool, FileDeleteTool, FileListTool, FileMoveTool, FileReadTool,
    FileWriteTool, ProcessTool,
};
pub use manager::ProcessManager;
pub use registry::{
    invoke_tool_calls_parallel, HookEmitter, NoopHookEmitter, Tool, ToolRegistry, ToolResult,
};
