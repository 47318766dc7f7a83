//! Tool trait, registry, and the invocation contract that wraps every
//! call with hook emission, denial handling, and panic-free error capture.

use std::collections::HashMap;
use std::sync::Arc;

use ad_domain::error::Result;
use ad_domain::event::{self, HookOutcome};
use ad_domain::message::{ToolCall, ToolSpec};
use ad_domain::trace::TraceEvent;
use serde_json::{Map, Value};

/// The outcome of running one tool.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolErrorInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub msg: String,
}

impl ToolResult {
    pub fn ok(output: Value) -> Self {
        Self { success: true, output: Some(output), error: None }
    }

    pub fn err(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self { success: false, output: None, error: Some(ToolErrorInfo { kind: kind.into(), msg: msg.into() }) }
    }

    /// The string content contributed to the transcript for this result:
    /// the stringified output on success, `"Error: <msg>"` on failure.
    pub fn to_content_string(&self) -> String {
        if self.success {
            match &self.output {
                Some(Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
                None => String::new(),
            }
        } else {
            let msg = self.error.as_ref().map(|e| e.msg.as_str()).unwrap_or("unknown error");
            format!("Error: {msg}")
        }
    }
}

/// A single invocable tool. Implementations never panic or leak errors as
/// Rust panics — any failure is captured and returned as a failed [`ToolResult`].
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, args: Value) -> ToolResult;
}

/// Callback that runs a named event through the hook pipeline (C1/C2) and
/// returns the reduced outcome. Decouples this crate from how hooks are
/// registered or prioritized.
#[async_trait::async_trait]
pub trait HookEmitter: Send + Sync {
    async fn emit(&self, event_name: &str, data: Map<String, Value>) -> HookOutcome;
}

/// A no-op emitter that always allows — useful for tests and for running
/// tools outside a full hook pipeline.
pub struct NoopHookEmitter;

#[async_trait::async_trait]
impl HookEmitter for NoopHookEmitter {
    async fn emit(&self, _event_name: &str, _data: Map<String, Value>) -> HookOutcome {
        event::reduce(&[])
    }
}

/// Holds every tool this process knows how to execute, keyed by name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name.clone();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool specs for every registered tool, for inclusion in a chat request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Execute one tool call within a parallel group, following the invocation
/// contract: emit `tool:pre`, honor a `deny` verdict, report a missing tool,
/// catch any execution failure, emit `tool:post`, and return the transcript
/// contribution as `(tool_call_id, content)`.
pub async fn invoke_tool_call(
    registry: &ToolRegistry,
    hooks: &dyn HookEmitter,
    call: &ToolCall,
    parallel_group_id: &str,
) -> (String, String) {
    let mut pre_data = Map::new();
    pre_data.insert("tool_name".into(), Value::String(call.tool_name.clone()));
    pre_data.insert("tool_input".into(), call.arguments.clone());
    pre_data.insert("parallel_group_id".into(), Value::String(parallel_group_id.to_string()));

    let outcome = hooks.emit("tool:pre", pre_data).await;
    if let HookOutcome::Denied { reason } = &outcome {
        return (call.call_id.clone(), format!("Denied by hook: {reason}"));
    }

    let Some(tool) = registry.get(&call.tool_name) else {
        let mut err_data = Map::new();
        err_data.insert("tool_name".into(), Value::String(call.tool_name.clone()));
        err_data.insert("reason".into(), Value::String("not_found".into()));
        hooks.emit("tool:error", err_data).await;
        return (call.call_id.clone(), format!("Error: Tool '{}' not found", call.tool_name));
    };

    let started = std::time::Instant::now();
    let result = tool.execute(call.arguments.clone()).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    TraceEvent::ToolInvoked {
        tool_name: call.tool_name.clone(),
        call_id: call.call_id.clone(),
        duration_ms,
        is_error: !result.success,
    }
    .emit();

    if !result.success {
        let mut err_data = Map::new();
        err_data.insert("tool_name".into(), Value::String(call.tool_name.clone()));
        if let Some(ref e) = result.error {
            err_data.insert("error".into(), Value::String(e.msg.clone()));
        }
        hooks.emit("tool:error", err_data).await;
    }

    let mut post_data = Map::new();
    post_data.insert("tool_name".into(), Value::String(call.tool_name.clone()));
    post_data.insert("tool_input".into(), call.arguments.clone());
    post_data.insert("result".into(), serde_json::to_value(&result).unwrap_or(Value::Null));
    post_data.insert("parallel_group_id".into(), Value::String(parallel_group_id.to_string()));
    hooks.emit("tool:post", post_data).await;

    (call.call_id.clone(), result.to_content_string())
}

/// Execute every tool call in a response concurrently, preserving the
/// original call order in the returned list regardless of completion order.
pub async fn invoke_tool_calls_parallel(
    registry: &ToolRegistry,
    hooks: &dyn HookEmitter,
    calls: &[ToolCall],
    parallel_group_id: &str,
) -> Vec<(String, String)> {
    let futures = calls.iter().map(|call| invoke_tool_call(registry, hooks, call, parallel_group_id));
    futures_util::future::join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_domain::message::ToolSpec;

    struct EchoTool;

    #[async_trait::async_trait]
    impl Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec { name: "echo".into(), description: "echoes input".into(), parameters: serde_json::json!({}) }
        }
        async fn execute(&self, args: Value) -> ToolResult {
            ToolResult::ok(args)
        }
    }

    struct AlwaysFailsTool;

    #[async_trait::async_trait]
    impl Tool for AlwaysFailsTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec { name: "boom".into(), description: "always fails".into(), parameters: serde_json::json!({}) }
        }
        async fn execute(&self, _args: Value) -> ToolResult {
            ToolResult::err("internal", "kaboom")
        }
    }

    struct DenyAllHooks;

    #[async_trait::async_trait]
    impl HookEmitter for DenyAllHooks {
        async fn emit(&self, event_name: &str, _data: Map<String, Value>) -> HookOutcome {
            if event_name == "tool:pre" {
                HookOutcome::Denied { reason: "policy".into() }
            } else {
                HookOutcome::Allowed { data_override: None, injected: vec![] }
            }
        }
    }

    fn call(name: &str, id: &str) -> ToolCall {
        ToolCall { call_id: id.into(), tool_name: name.into(), arguments: serde_json::json!({"x": 1}) }
    }

    #[tokio::test]
    async fn unknown_tool_reports_not_found() {
        let registry = ToolRegistry::new();
        let (id, content) = invoke_tool_call(&registry, &NoopHookEmitter, &call("missing", "c1"), "g1").await;
        assert_eq!(id, "c1");
        assert_eq!(content, "Error: Tool 'missing' not found");
    }

    #[tokio::test]
    async fn denied_hook_short_circuits_execution() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let (id, content) = invoke_tool_call(&registry, &DenyAllHooks, &call("echo", "c1"), "g1").await;
        assert_eq!(id, "c1");
        assert_eq!(content, "Denied by hook: policy");
    }

    #[tokio::test]
    async fn successful_tool_returns_stringified_output() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let (_id, content) = invoke_tool_call(&registry, &NoopHookEmitter, &call("echo", "c1"), "g1").await;
        assert!(content.contains("\"x\":1"));
    }

    #[tokio::test]
    async fn failing_tool_never_panics_and_reports_error_prefix() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(AlwaysFailsTool));
        let (_id, content) = invoke_tool_call(&registry, &NoopHookEmitter, &call("boom", "c1"), "g1").await;
        assert_eq!(content, "Error: kaboom");
    }

    #[tokio::test]
    async fn parallel_invocation_preserves_call_order() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(AlwaysFailsTool));
        let calls = vec![call("boom", "a"), call("echo", "b"), call("boom", "c")];
        let results = invoke_tool_calls_parallel(&registry, &NoopHookEmitter, &calls, "g1").await;
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
