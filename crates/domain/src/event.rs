use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A named event with structured payload, dispatched through the hook
/// registry. `data` is mutated in place by `Modify`/`InjectContext`
/// hook results as the event travels down the handler chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub data: Map<String, Value>,
}

impl Event {
    pub fn new(name: impl Into<String>, data: Map<String, Value>) -> Self {
        Self { name: name.into(), data }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }
}

/// The outcome of a single hook handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum HookResult {
    /// No opinion — the pipeline proceeds to the next handler unchanged.
    Continue,
    /// Halts the pipeline; the originating operation is aborted.
    Deny { reason: String },
    /// Replaces the event's data and continues to the next handler.
    Modify { data: Map<String, Value>, reason: Option<String> },
    /// Injects additional context (e.g. a message) ahead of the next
    /// provider call without altering the event's own data. See
    /// `ContextInjection` for what each field controls at BUILD_REQUEST
    /// time.
    InjectContext {
        content: String,
        reason: Option<String>,
        #[serde(default)]
        role: ContextInjectionRole,
        /// If true, affects only the request sent to the provider this
        /// turn — never the persisted transcript.
        #[serde(default)]
        ephemeral: bool,
        /// Merge into the last tool-role message's content instead of
        /// appending a new message. Only meaningful when `ephemeral`.
        #[serde(default)]
        append_to_last_tool_result: bool,
        /// Redact `content` from hook-result stream overlays.
        #[serde(default)]
        suppress_output: bool,
    },
}

/// Role to inject a non-appended context message as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextInjectionRole {
    #[default]
    System,
    User,
}

impl HookResult {
    pub fn is_deny(&self) -> bool {
        matches!(self, HookResult::Deny { .. })
    }
}

/// A single `InjectContext` result, carried forward into
/// `HookOutcome::Allowed` for the orchestrator's BUILD_REQUEST step to
/// act on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextInjection {
    pub content: String,
    pub role: ContextInjectionRole,
    pub ephemeral: bool,
    pub append_to_last_tool_result: bool,
    pub suppress_output: bool,
}

/// Precedence used by the hook registry's reducer when folding the
/// results of every handler registered for one event: the first `Deny`
/// wins outright; otherwise `Modify`/`InjectContext` accumulate in
/// registration order; `Continue` contributes nothing.
pub fn reduce(results: &[HookResult]) -> HookOutcome {
    let mut data_override: Option<Map<String, Value>> = None;
    let mut injected = Vec::new();

    for result in results {
        match result {
            HookResult::Deny { reason } => {
                return HookOutcome::Denied { reason: reason.clone() };
            }
            HookResult::Modify { data, .. } => {
                data_override = Some(data.clone());
            }
            HookResult::InjectContext { content, role, ephemeral, append_to_last_tool_result, suppress_output, .. } => {
                injected.push(ContextInjection {
                    content: content.clone(),
                    role: *role,
                    ephemeral: *ephemeral,
                    append_to_last_tool_result: *append_to_last_tool_result,
                    suppress_output: *suppress_output,
                });
            }
            HookResult::Continue => {}
        }
    }

    HookOutcome::Allowed { data_override, injected }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    Allowed { data_override: Option<Map<String, Value>>, injected: Vec<ContextInjection> },
    Denied { reason: String },
}

impl HookOutcome {
    pub fn is_denied(&self) -> bool {
        matches!(self, HookOutcome::Denied { .. })
    }
}
