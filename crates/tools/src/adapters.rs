//! Wraps the exec/process/file-ops implementations as [`registry::Tool`]s so
//! they can be registered in a [`registry::ToolRegistry`] alongside whatever
//! else a mount plan brings in.

use std::path::PathBuf;
use std::sync::Arc;

use ad_domain::message::ToolSpec;
use serde_json::Value;

use crate::file_ops::{
    self, FileAppendRequest, FileDeleteRequest, FileListRequest, FileMoveRequest, FileReadRequest,
    FileWriteRequest,
};
use crate::manager::ProcessManager;
use crate::registry::{Tool, ToolResult};
use crate::{exec, process};

fn arg_err(tool: &str, e: serde_json::Error) -> ToolResult {
    ToolResult::err("invalid_arguments", format!("{tool}: {e}"))
}

/// Runs foreground or background shell commands, confined to a workspace.
pub struct ExecTool {
    manager: Arc<ProcessManager>,
    workspace_root: PathBuf,
}

impl ExecTool {
    pub fn new(manager: Arc<ProcessManager>, workspace_root: PathBuf) -> Self {
        Self { manager, workspace_root }
    }
}

#[async_trait::async_trait]
impl Tool for ExecTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "exec".into(),
            description: "Run a shell command. Long-running commands are auto-backgrounded and \
                managed through the `process` tool."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string"},
                    "background": {"type": "boolean"},
                    "yield_ms": {"type": "integer"},
                    "timeout_sec": {"type": "integer"},
                    "workdir": {"type": "string"},
                    "env": {"type": "object", "additionalProperties": {"type": "string"}},
                },
                "required": ["command"],
            }),
        }
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let req = match serde_json::from_value(args) {
            Ok(r) => r,
            Err(e) => return arg_err("exec", e),
        };
        let response = exec::exec(&self.manager, &self.workspace_root, req).await;
        match serde_json::to_value(&response) {
            Ok(v) => ToolResult::ok(v),
            Err(e) => ToolResult::err("serialization", e.to_string()),
        }
    }
}

/// Manages background processes started by [`ExecTool`].
pub struct ProcessTool {
    manager: Arc<ProcessManager>,
}

impl ProcessTool {
    pub fn new(manager: Arc<ProcessManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl Tool for ProcessTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "process".into(),
            description: "Inspect or control a background process session started by `exec`."
                .into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["list", "poll", "log", "write", "kill", "clear", "remove"]},
                    "session_id": {"type": "string"},
                    "offset": {"type": "integer"},
                    "limit": {"type": "integer"},
                    "tail_lines": {"type": "integer"},
                    "data": {"type": "string"},
                    "eof": {"type": "boolean"},
                },
                "required": ["action"],
            }),
        }
    }

    async fn execute(&self, args: Value) -> ToolResult {
        let req = match serde_json::from_value(args) {
            Ok(r) => r,
            Err(e) => return arg_err("process", e),
        };
        let response = process::handle_process(&self.manager, req).await;
        if response.success {
            ToolResult::ok(response.data.unwrap_or(Value::Null))
        } else {
            ToolResult::err("process_error", response.error.unwrap_or_else(|| "unknown error".into()))
        }
    }
}

fn file_result<T: serde::Serialize>(r: Result<T, String>) -> ToolResult {
    match r {
        Ok(v) => match serde_json::to_value(v) {
            Ok(v) => ToolResult::ok(v),
            Err(e) => ToolResult::err("serialization", e.to_string()),
        },
        Err(msg) => ToolResult::err("file_error", msg),
    }
}

macro_rules! file_tool {
    ($ty:ident, $name:literal, $desc:literal, $req:ty, $func:path, $props:tt, $required:tt) => {
        pub struct $ty {
            workspace_root: PathBuf,
        }

        impl $ty {
            pub fn new(workspace_root: PathBuf) -> Self {
                Self { workspace_root }
            }
        }

        #[async_trait::async_trait]
        impl Tool for $ty {
            fn spec(&self) -> ToolSpec {
                ToolSpec {
                    name: $name.into(),
                    description: $desc.into(),
                    parameters: serde_json::json!({
                        "type": "object",
                        "properties": $props,
                        "required": $required,
                    }),
                }
            }

            async fn execute(&self, args: Value) -> ToolResult {
                let req: $req = match serde_json::from_value(args) {
                    Ok(r) => r,
                    Err(e) => return arg_err($name, e),
                };
                file_result($func(&self.workspace_root, req).await)
            }
        }
    };
}

file_tool!(
    FileReadTool,
    "file_read",
    "Read a file within the workspace, optionally by line offset/limit.",
    FileReadRequest,
    file_ops::file_read,
    {"path": {"type": "string"}, "offset": {"type": "integer"}, "limit": {"type": "integer"}},
    ["path"]
);

file_tool!(
    FileWriteTool,
    "file_write",
    "Create or overwrite a file within the workspace.",
    FileWriteRequest,
    file_ops::file_write,
    {"path": {"type": "string"}, "content": {"type": "string"}},
    ["path", "content"]
);

file_tool!(
    FileAppendTool,
    "file_append",
    "Append content to a file within the workspace.",
    FileAppendRequest,
    file_ops::file_append,
    {"path": {"type": "string"}, "content": {"type": "string"}},
    ["path", "content"]
);

file_tool!(
    FileMoveTool,
    "file_move",
    "Move or rename a file or directory within the workspace.",
    FileMoveRequest,
    file_ops::file_move,
    {"source": {"type": "string"}, "destination": {"type": "string"}},
    ["source", "destination"]
);

file_tool!(
    FileDeleteTool,
    "file_delete",
    "Delete a file or empty directory within the workspace.",
    FileDeleteRequest,
    file_ops::file_delete,
    {"path": {"type": "string"}},
    ["path"]
);

file_tool!(
    FileListTool,
    "file_list",
    "List a directory's contents within the workspace.",
    FileListRequest,
    file_ops::file_list,
    {"path": {"type": "string"}},
    []
);
