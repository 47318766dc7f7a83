use serde::Serialize;

/// Structured trace events emitted across every crate in this workspace.
/// Each variant is logged as a single `tracing::info!` record carrying
/// its JSON encoding, so downstream log processors can filter on
/// `trace_event.event` without parsing free text.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionCreated { session_id: String, profile_id: String },
    SessionStatusChanged { session_id: String, status: String },
    TranscriptAppend { session_id: String, lines: usize },
    ProviderRequest {
        provider: String,
        model: String,
        streaming: bool,
        duration_ms: u64,
        prompt_tokens: Option<u32>,
        completion_tokens: Option<u32>,
    },
    ToolInvoked { tool_name: String, call_id: String, duration_ms: u64, is_error: bool },
    HookDenied { event_name: String, hook_name: String, reason: String },
    AutomationFired { schedule_id: String, run_id: String },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "trace_event");
    }
}
