//! Orchestrator Loop (C5) — the agentic state machine: build a chat
//! request from the session transcript, call the provider, route on tool
//! calls vs. terminal text, execute tool calls in parallel via C3, and
//! repeat until a terminal answer or the iteration cap.
//!
//! One call to [`run_turn`] drives exactly one user prompt through to
//! completion, per the `START → PROMPT_EMIT → BUILD_REQUEST →
//! PROVIDER_CALL → EMIT_BLOCKS → ROUTE → ...` state machine. Events are
//! delivered on the returned channel the way `run_turn`/`run_turn_inner`
//! did in the teacher's turn runner — a background task drives the loop
//! and the caller (C6, C9) only ever reads from the receiver.

use std::collections::HashSet;
use std::sync::Arc;

use ad_domain::config::OrchestratorConfig;
use ad_domain::event::{ContextInjection, ContextInjectionRole, HookOutcome};
use ad_domain::message::{ContentBlock, Message, MessageContent, Role, ToolCall, ToolSpec};
use ad_domain::stream::Usage;
use ad_providers::{ChatRequest, ChatResponse};
use ad_sessions::TranscriptWriter;
use ad_tools::invoke_tool_calls_parallel;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::coordinator::Coordinator;
use crate::runtime::cancel::CancelToken;

/// One user-visible event produced while a turn runs. Mirrors the SSE
/// event names spec.md §4.9 surfaces to clients; `hook:*` overlay frames
/// are published separately by the hook registry's own stream emitter.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    UserMessageSaved,
    AssistantMessageStart,
    Content { text: String },
    AssistantMessageComplete { content: String },
    ExecutionError { message: String },
    Done { status: String },
}

/// Everything one turn needs: the mounted modules, where to persist, and
/// the tuning knobs that came in on the mount plan.
pub struct TurnContext {
    pub coordinator: Arc<Coordinator>,
    pub transcript: Arc<TranscriptWriter>,
    pub session_id: String,
    pub config: OrchestratorConfig,
    /// Explicit provider override; `None` selects by ascending priority.
    pub provider_id: Option<String>,
    /// Checked once per loop iteration; cancelling mid-turn stops the loop
    /// cleanly at the next iteration boundary rather than mid-provider-call.
    pub cancel: CancelToken,
}

/// Spawn the turn's background task and return the event channel the
/// caller streams to its SSE subscribers.
pub fn run_turn(ctx: TurnContext, prompt: String) -> mpsc::Receiver<TurnEvent> {
    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        run_turn_inner(ctx, prompt, tx).await;
    });
    rx
}

async fn run_turn_inner(ctx: TurnContext, prompt: String, tx: mpsc::Sender<TurnEvent>) {
    let span = tracing::info_span!("turn", session_id = %ctx.session_id);
    let _enter = span.enter();

    // 1. PROMPT_EMIT
    let mut data = Map::new();
    data.insert("prompt".into(), Value::String(prompt.clone()));
    let outcome = ctx.coordinator.hooks.emit("prompt:submit", data).await;
    let outcome = ctx.coordinator.process_hook_result("prompt:submit", outcome);
    if let HookOutcome::Denied { reason } = outcome {
        finish_denied(&ctx, &tx, &reason).await;
        return;
    }

    // 2. Context persistence.
    if let Err(e) = ctx.transcript.append(&ctx.session_id, Message::user(prompt)) {
        let _ = tx.send(TurnEvent::ExecutionError { message: format!("failed to persist prompt: {e}") }).await;
        let _ = tx.send(TurnEvent::Done { status: "failed".into() }).await;
        return;
    }
    let _ = tx.send(TurnEvent::UserMessageSaved).await;

    let history = match ctx.transcript.read(&ctx.session_id) {
        Ok(lines) => lines.into_iter().map(|l| l.message).collect::<Vec<Message>>(),
        Err(e) => {
            let _ = tx.send(TurnEvent::ExecutionError { message: format!("failed to read transcript: {e}") }).await;
            let _ = tx.send(TurnEvent::Done { status: "failed".into() }).await;
            return;
        }
    };

    // 3. Compaction gate (in-memory only — the persisted transcript never shrinks).
    let mut working_messages = if history.len() > ctx.config.compaction_max_turns {
        ctx.coordinator.hooks.emit("context:pre_compact", Map::new()).await;
        let compacted = compact(&history, ctx.config.compaction_keep_last_turns);
        ctx.coordinator.hooks.emit("context:post_compact", Map::new()).await;
        compacted
    } else {
        history
    };

    // 4. Provider selection.
    let provider = match ctx.provider_id.as_deref() {
        Some(id) => ctx.coordinator.providers.get(id),
        None => ctx.coordinator.providers.default_provider(),
    };
    let Some(provider) = provider else {
        let _ = tx.send(TurnEvent::ExecutionError { message: "no provider available".into() }).await;
        finish(&ctx, &tx, "failed", 0).await;
        return;
    };

    let _ = tx.send(TurnEvent::AssistantMessageStart).await;

    let tool_specs = ctx.coordinator.tools.specs();
    let mut iteration: u32 = 0;
    let mut final_content: Option<String> = None;
    let mut status = "success";

    loop {
        if ctx.cancel.is_cancelled() {
            finish(&ctx, &tx, "cancelled", iteration).await;
            return;
        }

        // 5. BUILD_REQUEST
        let mut req_data = Map::new();
        req_data.insert("provider".into(), Value::String(provider.provider_id().to_owned()));
        req_data.insert("iteration".into(), Value::from(iteration));
        let outcome = ctx.coordinator.hooks.emit("provider:request", req_data).await;
        let outcome = ctx.coordinator.process_hook_result("provider:request", outcome);

        let mut request_messages = match outcome {
            HookOutcome::Denied { reason } => {
                finish_denied(&ctx, &tx, &reason).await;
                return;
            }
            HookOutcome::Allowed { injected, .. } => apply_injections(&working_messages, &injected),
        };

        let repaired_ids = repair_tool_sequence(&mut request_messages);
        if !repaired_ids.is_empty() {
            let mut repair_data = Map::new();
            repair_data.insert("tool_call_ids".into(), Value::from(repaired_ids));
            ctx.coordinator.hooks.emit("provider:tool_sequence_repaired", repair_data).await;
        }

        // 6. PROVIDER_CALL
        let request = ChatRequest { messages: request_messages.clone(), tools: tool_specs.clone(), ..Default::default() };
        let response = match provider.chat(request).await {
            Ok(r) => r,
            Err(e) => {
                let mut err_data = Map::new();
                err_data.insert("provider".into(), Value::String(provider.provider_id().to_owned()));
                err_data.insert("status".into(), Value::String("error".into()));
                err_data.insert("message".into(), Value::String(e.to_string()));
                ctx.coordinator.hooks.emit("llm:response", err_data).await;
                let _ = tx.send(TurnEvent::ExecutionError { message: e.to_string() }).await;
                finish(&ctx, &tx, "incomplete", iteration).await;
                return;
            }
        };
        let response = if response.finish_reason.as_deref() == Some("incomplete") {
            continue_incomplete(&ctx, &provider, &request_messages, &tool_specs, response).await
        } else {
            response
        };

        let mut resp_data = Map::new();
        resp_data.insert("provider".into(), Value::String(provider.provider_id().to_owned()));
        resp_data.insert("tool_calls".into(), Value::Bool(!response.tool_calls.is_empty()));
        if let Some(usage) = &response.usage {
            resp_data.insert("usage".into(), serde_json::to_value(usage).unwrap_or(Value::Null));
        }
        ctx.coordinator.hooks.emit("provider:response", resp_data).await;

        // 7. EMIT_BLOCKS
        emit_blocks(&ctx, &response.content, &response.tool_calls, response.usage.as_ref()).await;

        // 8. ROUTE
        if !response.tool_calls.is_empty() {
            let assistant_msg = build_assistant_message(&response.content, &response.tool_calls, response.thinking.clone());
            if let Err(e) = ctx.transcript.append(&ctx.session_id, assistant_msg.clone()) {
                tracing::warn!(error = %e, "failed to persist assistant tool-call message");
            }
            working_messages.push(assistant_msg);

            let group_id = uuid::Uuid::new_v4().to_string();
            let results =
                invoke_tool_calls_parallel(&ctx.coordinator.tools, &*ctx.coordinator.hooks, &response.tool_calls, &group_id)
                    .await;
            for (call_id, content) in results {
                let is_error = content.starts_with("Error") || content.starts_with("Denied");
                let tool_msg = Message::tool_result(call_id, content, is_error);
                if let Err(e) = ctx.transcript.append(&ctx.session_id, tool_msg.clone()) {
                    tracing::warn!(error = %e, "failed to persist tool-result message");
                }
                working_messages.push(tool_msg);
            }

            iteration += 1;
            if iteration >= ctx.config.max_iterations {
                let (content, reminder_status) = over_cap(&ctx, &provider, &working_messages, &tool_specs).await;
                final_content = Some(content);
                status = reminder_status;
                break;
            }
            continue;
        } else if !response.content.is_empty() {
            let assistant_msg = build_assistant_message(&response.content, &[], response.thinking.clone());
            if let Err(e) = ctx.transcript.append(&ctx.session_id, assistant_msg) {
                tracing::warn!(error = %e, "failed to persist assistant message");
            }
            let _ = tx.send(TurnEvent::Content { text: response.content.clone() }).await;
            final_content = Some(response.content);
            break;
        } else {
            tracing::warn!(iteration, "provider response had neither text nor tool calls");
            iteration += 1;
            if iteration >= ctx.config.max_iterations {
                let (content, reminder_status) = over_cap(&ctx, &provider, &working_messages, &tool_specs).await;
                final_content = Some(content);
                status = reminder_status;
                break;
            }
            continue;
        }
    }

    let final_content = final_content.unwrap_or_default();
    let _ = tx.send(TurnEvent::AssistantMessageComplete { content: final_content.clone() }).await;

    // 10. COMPLETION
    let mut complete_data = Map::new();
    let preview: String = final_content.chars().take(200).collect();
    complete_data.insert("response_preview".into(), Value::String(preview));
    complete_data.insert("length".into(), Value::from(final_content.len() as u64));
    ctx.coordinator.hooks.emit("prompt:complete", complete_data).await;

    let mut orch_data = Map::new();
    orch_data.insert("orchestrator".into(), Value::String("default".into()));
    orch_data.insert("turn_count".into(), Value::from(iteration));
    orch_data.insert("status".into(), Value::String(status.into()));
    ctx.coordinator.hooks.emit("orchestrator:complete", orch_data).await;

    let _ = tx.send(TurnEvent::Done { status: status.into() }).await;
}

/// 9. OVER_CAP — one ephemeral reminder, one more provider call, whatever
/// comes back (text or not) is persisted as the final answer.
async fn over_cap(
    ctx: &TurnContext,
    provider: &Arc<dyn ad_providers::LlmProvider>,
    working_messages: &[Message],
    tool_specs: &[ad_domain::message::ToolSpec],
) -> (String, &'static str) {
    let mut reminder_messages = working_messages.to_vec();
    reminder_messages.push(Message::system(
        "You have reached the tool-call iteration limit for this turn. Summarize your progress so far and provide a final answer now.",
    ));

    let request = ChatRequest { messages: reminder_messages, tools: tool_specs.to_vec(), ..Default::default() };
    match provider.chat(request).await {
        Ok(response) => {
            let content = if !response.content.is_empty() {
                response.content
            } else {
                "Reached the iteration limit without a final answer.".to_string()
            };
            let assistant_msg = Message::assistant(content.clone());
            if let Err(e) = ctx.transcript.append(&ctx.session_id, assistant_msg) {
                tracing::warn!(error = %e, "failed to persist over-cap assistant message");
            }
            (content, "success")
        }
        Err(e) => (format!("Reached the iteration limit and the final provider call failed: {e}"), "incomplete"),
    }
}

/// Usage is attached only to the last block's `content_block:end` — by
/// the time every block has been emitted the provider has told us the
/// final token accounting for the whole response, not any one block.
async fn emit_blocks(ctx: &TurnContext, text: &str, tool_calls: &[ToolCall], usage: Option<&Usage>) {
    let mut blocks: Vec<Value> = Vec::new();
    if !text.is_empty() {
        blocks.push(serde_json::json!({"type": "text", "text": text}));
    }
    for call in tool_calls {
        blocks.push(serde_json::json!({"type": "tool_use", "id": call.call_id, "name": call.tool_name, "input": call.arguments}));
    }
    let total = blocks.len();
    for (i, block) in blocks.into_iter().enumerate() {
        let mut start = Map::new();
        start.insert("block_type".into(), block["type"].clone());
        start.insert("block_index".into(), Value::from(i as u64));
        start.insert("total_blocks".into(), Value::from(total as u64));
        ctx.coordinator.hooks.emit("content_block:start", start).await;

        let mut end = Map::new();
        end.insert("block_index".into(), Value::from(i as u64));
        end.insert("total_blocks".into(), Value::from(total as u64));
        if i + 1 == total {
            if let Some(u) = usage {
                end.insert("usage".into(), serde_json::to_value(u).unwrap_or(Value::Null));
            }
        }
        end.insert("block".into(), block);
        ctx.coordinator.hooks.emit("content_block:end", end).await;
    }
}

/// Builds the assistant message persisted to the transcript and carried
/// forward in `working_messages`. A captured thinking block is placed
/// first so providers that require it ahead of tool use (Anthropic) see
/// it in the right position when it's replayed next turn.
fn build_assistant_message(text: &str, tool_calls: &[ToolCall], thinking: Option<ContentBlock>) -> Message {
    let mut parts = Vec::new();
    if let Some(block) = thinking {
        parts.push(block);
    }
    if !text.is_empty() {
        parts.push(ContentBlock::Text { text: text.to_string() });
    }
    for call in tool_calls {
        parts.push(ContentBlock::ToolUse { id: call.call_id.clone(), name: call.tool_name.clone(), input: call.arguments.clone() });
    }
    Message { role: Role::Assistant, content: MessageContent::Parts(parts) }
}

/// Resubmits a response a provider reported as truncated (`finish_reason
/// == "incomplete"`), concatenating accumulated text across attempts, up
/// to `config.max_continuations`. Gives up and returns the best partial
/// response if a continuation call itself fails.
async fn continue_incomplete(
    ctx: &TurnContext,
    provider: &Arc<dyn ad_providers::LlmProvider>,
    request_messages: &[Message],
    tool_specs: &[ToolSpec],
    mut response: ChatResponse,
) -> ChatResponse {
    let mut accumulated = response.content.clone();
    let mut attempt = 0u32;

    while response.finish_reason.as_deref() == Some("incomplete") && attempt < ctx.config.max_continuations {
        attempt += 1;

        let mut continue_data = Map::new();
        continue_data.insert("provider".into(), Value::String(provider.provider_id().to_owned()));
        continue_data.insert("attempt".into(), Value::from(attempt));
        ctx.coordinator.hooks.emit("provider:incomplete_continuation", continue_data).await;

        let mut continuation_messages = request_messages.to_vec();
        continuation_messages.push(Message::assistant(accumulated.clone()));
        continuation_messages.push(Message::user("Continue your previous response exactly where it left off."));

        let request = ChatRequest { messages: continuation_messages, tools: tool_specs.to_vec(), ..Default::default() };
        match provider.chat(request).await {
            Ok(next) => {
                accumulated.push_str(&next.content);
                response = ChatResponse { content: accumulated.clone(), ..next };
            }
            Err(e) => {
                tracing::warn!(error = %e, attempt, "incomplete-response continuation failed");
                break;
            }
        }
    }

    response
}

/// Ephemeral inject_context results only affect the copy of messages sent
/// to the provider this call — never the persisted transcript or the
/// carried-forward `working_messages`. Non-ephemeral injections are
/// assumed to already be on the transcript via some other path (e.g. a
/// `Modify` result on the same event) and are left untouched here.
fn apply_injections(working_messages: &[Message], injected: &[ContextInjection]) -> Vec<Message> {
    let mut messages = working_messages.to_vec();
    for injection in injected {
        if !injection.ephemeral {
            continue;
        }
        if injection.append_to_last_tool_result {
            if let Some(last_tool) = messages.iter_mut().rev().find(|m| m.role == Role::Tool) {
                append_to_tool_result(last_tool, &injection.content);
                continue;
            }
            // No tool-result message to merge into — fall back to a
            // plain injected message so the content isn't dropped.
        }
        messages.push(injected_message(injection));
    }
    messages
}

fn injected_message(injection: &ContextInjection) -> Message {
    match injection.role {
        ContextInjectionRole::System => Message::system(injection.content.clone()),
        ContextInjectionRole::User => Message::user(injection.content.clone()),
    }
}

fn append_to_tool_result(message: &mut Message, text: &str) {
    match &mut message.content {
        MessageContent::Parts(parts) => {
            if let Some(ContentBlock::ToolResult { content, .. }) =
                parts.iter_mut().rev().find(|p| matches!(p, ContentBlock::ToolResult { .. }))
            {
                content.push_str("\n\n");
                content.push_str(text);
                return;
            }
            parts.push(ContentBlock::Text { text: text.to_string() });
        }
        MessageContent::Text(existing) => {
            existing.push_str("\n\n");
            existing.push_str(text);
        }
    }
}

/// Scans for `tool_use` blocks in assistant messages with no matching
/// `tool_result` later in the transcript and appends a synthetic denial
/// result for each, so a provider never sees a dangling tool call it
/// would otherwise reject outright. Returns the repaired call ids.
fn repair_tool_sequence(messages: &mut Vec<Message>) -> Vec<String> {
    let mut called_ids: Vec<String> = Vec::new();
    for msg in messages.iter() {
        if msg.role != Role::Assistant {
            continue;
        }
        if let MessageContent::Parts(parts) = &msg.content {
            for part in parts {
                if let ContentBlock::ToolUse { id, .. } = part {
                    called_ids.push(id.clone());
                }
            }
        }
    }

    let mut answered_ids: HashSet<String> = HashSet::new();
    for msg in messages.iter() {
        if msg.role != Role::Tool {
            continue;
        }
        if let MessageContent::Parts(parts) = &msg.content {
            for part in parts {
                if let ContentBlock::ToolResult { tool_use_id, .. } = part {
                    answered_ids.insert(tool_use_id.clone());
                }
            }
        }
    }

    let mut repaired = Vec::new();
    for id in called_ids {
        if answered_ids.contains(&id) {
            continue;
        }
        messages.push(Message::tool_result(
            id.clone(),
            "No result was recorded for this tool call; treating it as cancelled.",
            true,
        ));
        repaired.push(id);
    }
    repaired
}

/// Built-in compactor: drop everything but the last `keep_last` messages,
/// replacing the dropped prefix with one summarizing system message.
fn compact(messages: &[Message], keep_last: usize) -> Vec<Message> {
    if messages.len() <= keep_last {
        return messages.to_vec();
    }
    let dropped = messages.len() - keep_last;
    let mut compacted = vec![Message::system(format!(
        "[{dropped} earlier messages omitted for length; conversation continues below.]"
    ))];
    compacted.extend_from_slice(&messages[dropped..]);
    compacted
}

async fn finish_denied(ctx: &TurnContext, tx: &mpsc::Sender<TurnEvent>, reason: &str) {
    let content = format!("Operation denied: {reason}");
    let assistant_msg = Message::assistant(content.clone());
    if let Err(e) = ctx.transcript.append(&ctx.session_id, assistant_msg) {
        tracing::warn!(error = %e, "failed to persist denial message");
    }
    let _ = tx.send(TurnEvent::AssistantMessageComplete { content }).await;

    let mut orch_data = Map::new();
    orch_data.insert("orchestrator".into(), Value::String("default".into()));
    orch_data.insert("turn_count".into(), Value::from(0u32));
    orch_data.insert("status".into(), Value::String("denied".into()));
    ctx.coordinator.hooks.emit("orchestrator:complete", orch_data).await;

    let _ = tx.send(TurnEvent::Done { status: "denied".into() }).await;
}

async fn finish(ctx: &TurnContext, tx: &mpsc::Sender<TurnEvent>, status: &str, turn_count: u32) {
    let mut orch_data = Map::new();
    orch_data.insert("orchestrator".into(), Value::String("default".into()));
    orch_data.insert("turn_count".into(), Value::from(turn_count));
    orch_data.insert("status".into(), Value::String(status.into()));
    ctx.coordinator.hooks.emit("orchestrator:complete", orch_data).await;
    let _ = tx.send(TurnEvent::Done { status: status.into() }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_domain::config::LlmConfig;
    use ad_domain::error::Result;
    use ad_domain::message::{ToolCall, ToolSpec};
    use ad_domain::stream::{BoxStream, StreamEvent, Usage};
    use ad_providers::{ChatResponse, LlmProvider, ProviderRegistry};
    use ad_tools::ToolRegistry;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::hooks::HookRegistry;

    /// A scripted provider: returns one tool-call response, then a final
    /// text response, regardless of how many times it's called beyond that.
    struct ScriptedProvider {
        capabilities: ad_domain::capability::ProviderCapabilities,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new() -> Self {
            Self { capabilities: ad_domain::capability::ProviderCapabilities::default(), calls: AtomicUsize::new(0) }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(ChatResponse {
                    content: String::new(),
                    tool_calls: vec![ToolCall { call_id: "c1".into(), tool_name: "echo".into(), arguments: serde_json::json!({}) }],
                    usage: Some(Usage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 }),
                    model: "scripted".into(),
                    finish_reason: Some("tool_calls".into()),
                    thinking: None,
                })
            } else {
                Ok(ChatResponse {
                    content: "final answer".into(),
                    tool_calls: vec![],
                    usage: Some(Usage { prompt_tokens: 20, completion_tokens: 5, total_tokens: 25 }),
                    model: "scripted".into(),
                    finish_reason: Some("stop".into()),
                    thinking: None,
                })
            }
        }

        async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            unimplemented!("not used by orchestrator tests")
        }

        fn capabilities(&self) -> &ad_domain::capability::ProviderCapabilities {
            &self.capabilities
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    struct EchoTool;

    #[async_trait::async_trait]
    impl ad_tools::Tool for EchoTool {
        fn spec(&self) -> ToolSpec {
            ToolSpec { name: "echo".into(), description: "echo".into(), parameters: serde_json::json!({}) }
        }
        async fn execute(&self, args: Value) -> ad_tools::ToolResult {
            ad_tools::ToolResult::ok(args)
        }
    }

    fn make_context(session_id: &str, tmp: &std::path::Path) -> TurnContext {
        let providers = ProviderRegistry::from_config(&LlmConfig::default()).unwrap();
        let mut tool_registry = ToolRegistry::new();
        tool_registry.register(Arc::new(EchoTool));
        let hooks = Arc::new(HookRegistry::new());
        let coordinator = Arc::new(Coordinator::new(Arc::new(providers), Arc::new(tool_registry), hooks));

        let transcript = Arc::new(TranscriptWriter::new(tmp));
        transcript.append(session_id, Message::system("seed")).unwrap();

        TurnContext {
            coordinator,
            transcript,
            session_id: session_id.to_string(),
            config: OrchestratorConfig { max_iterations: 5, ..OrchestratorConfig::default() },
            provider_id: None,
            cancel: CancelToken::new(),
        }
    }

    #[tokio::test]
    async fn denied_prompt_terminates_immediately() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = make_context("s1", tmp.path());
        ctx.coordinator.hooks.register("prompt:submit", 0, "denier", |_| async {
            ad_domain::event::HookResult::Deny { reason: "blocked".into() }
        });

        let mut rx = run_turn(ctx, "do something".into());
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }

        assert!(matches!(events.last(), Some(TurnEvent::Done { status }) if status == "denied"));
        assert!(events.iter().any(|e| matches!(e, TurnEvent::AssistantMessageComplete { content } if content.contains("blocked"))));
    }

    #[tokio::test]
    async fn tool_call_then_final_text_completes_successfully() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = make_context("s2", tmp.path());
        let scripted: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new());
        ctx.provider_id = Some("scripted".into());
        let mut providers_map = std::collections::HashMap::new();
        providers_map.insert("scripted".to_string(), scripted);
        let registry = test_registry_with(providers_map, vec!["scripted".to_string()]);
        ctx.coordinator = Arc::new(Coordinator::new(Arc::new(registry), ctx.coordinator.tools.clone(), ctx.coordinator.hooks.clone()));

        let mut rx = run_turn(ctx, "please echo".into());
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }

        assert!(events.iter().any(|e| matches!(e, TurnEvent::AssistantMessageComplete { content } if content == "final answer")));
        assert!(matches!(events.last(), Some(TurnEvent::Done { status }) if status == "success"));
    }

    fn test_registry_with(
        map: std::collections::HashMap<String, Arc<dyn LlmProvider>>,
        order: Vec<String>,
    ) -> ProviderRegistry {
        ProviderRegistry::from_parts(map, order, Vec::new())
    }

    #[tokio::test]
    async fn compaction_keeps_last_n_and_summarizes_the_rest() {
        let messages: Vec<Message> = (0..10).map(|i| Message::user(format!("msg {i}"))).collect();
        let compacted = compact(&messages, 3);
        assert_eq!(compacted.len(), 4);
        assert!(compacted[0].content.extract_all_text().contains("7 earlier messages omitted"));
        assert_eq!(compacted[1].content.extract_all_text(), "msg 7");
    }

    #[test]
    fn compaction_is_noop_under_threshold() {
        let messages: Vec<Message> = (0..3).map(|i| Message::user(format!("msg {i}"))).collect();
        let compacted = compact(&messages, 10);
        assert_eq!(compacted.len(), 3);
    }

    // ── apply_injections ────────────────────────────────────────────

    fn injection(content: &str, ephemeral: bool, append: bool) -> ContextInjection {
        ContextInjection {
            content: content.into(),
            role: ContextInjectionRole::System,
            ephemeral,
            append_to_last_tool_result: append,
            suppress_output: false,
        }
    }

    #[test]
    fn non_ephemeral_injection_is_left_for_the_transcript() {
        let messages = vec![Message::user("hi")];
        let out = apply_injections(&messages, &[injection("ignored", false, false)]);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn ephemeral_injection_pushes_a_message_in_the_requested_role() {
        let messages = vec![Message::user("hi")];
        let mut inj = injection("extra context", true, false);
        inj.role = ContextInjectionRole::User;
        let out = apply_injections(&messages, &[inj]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].role, Role::User);
        assert_eq!(out[1].content.extract_all_text(), "extra context");
    }

    #[test]
    fn ephemeral_append_merges_into_last_tool_result_without_new_message() {
        let messages = vec![Message::user("hi"), Message::tool_result("call_1", "raw output", false)];
        let out = apply_injections(&messages, &[injection("note: truncated", true, true)]);
        assert_eq!(out.len(), 2);
        match &out[1].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentBlock::ToolResult { content, .. } => {
                    assert!(content.contains("raw output"));
                    assert!(content.contains("note: truncated"));
                }
                other => panic!("expected tool result, got {other:?}"),
            },
            other => panic!("expected parts, got {other:?}"),
        }
    }

    #[test]
    fn ephemeral_append_with_no_tool_message_falls_back_to_new_message() {
        let messages = vec![Message::user("hi")];
        let out = apply_injections(&messages, &[injection("note", true, true)]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].role, Role::System);
    }

    // ── repair_tool_sequence ─────────────────────────────────────────

    #[test]
    fn repair_tool_sequence_is_noop_when_every_call_is_answered() {
        let mut messages = vec![
            Message {
                role: Role::Assistant,
                content: MessageContent::Parts(vec![ContentBlock::ToolUse {
                    id: "c1".into(),
                    name: "exec".into(),
                    input: serde_json::json!({}),
                }]),
            },
            Message::tool_result("c1", "ok", false),
        ];
        let repaired = repair_tool_sequence(&mut messages);
        assert!(repaired.is_empty());
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn repair_tool_sequence_synthesizes_a_denial_for_dangling_calls() {
        let mut messages = vec![Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentBlock::ToolUse {
                id: "c1".into(),
                name: "exec".into(),
                input: serde_json::json!({}),
            }]),
        }];
        let repaired = repair_tool_sequence(&mut messages);
        assert_eq!(repaired, vec!["c1".to_string()]);
        assert_eq!(messages.len(), 2);
        match &messages[1].content {
            MessageContent::Parts(parts) => match &parts[0] {
                ContentBlock::ToolResult { tool_use_id, is_error, .. } => {
                    assert_eq!(tool_use_id, "c1");
                    assert!(is_error);
                }
                other => panic!("expected tool result, got {other:?}"),
            },
            other => panic!("expected parts, got {other:?}"),
        }
    }

    // ── build_assistant_message ─────────────────────────────────────

    #[test]
    fn build_assistant_message_places_thinking_block_first() {
        let thinking = ContentBlock::Thinking { encrypted: "trace".into(), reasoning_id: Some("sig".into()) };
        let msg = build_assistant_message("answer", &[], Some(thinking));
        match &msg.content {
            MessageContent::Parts(parts) => {
                assert!(matches!(parts[0], ContentBlock::Thinking { .. }));
                assert!(matches!(parts[1], ContentBlock::Text { .. }));
            }
            other => panic!("expected parts, got {other:?}"),
        }
    }

    // ── continue_incomplete ──────────────────────────────────────────

    struct IncompleteThenDoneProvider {
        capabilities: ad_domain::capability::ProviderCapabilities,
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LlmProvider for IncompleteThenDoneProvider {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let content = if call == 0 { " more".to_string() } else { " done.".to_string() };
            let finish_reason = if call == 0 { "incomplete" } else { "stop" };
            Ok(ChatResponse {
                content,
                tool_calls: vec![],
                usage: None,
                model: "scripted".into(),
                finish_reason: Some(finish_reason.into()),
                thinking: None,
            })
        }

        async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
            unimplemented!("not used by this test")
        }

        fn capabilities(&self) -> &ad_domain::capability::ProviderCapabilities {
            &self.capabilities
        }

        fn provider_id(&self) -> &str {
            "incomplete-then-done"
        }
    }

    #[tokio::test]
    async fn continue_incomplete_concatenates_across_resubmissions() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = make_context("s3", tmp.path());
        let provider: Arc<dyn LlmProvider> = Arc::new(IncompleteThenDoneProvider {
            capabilities: ad_domain::capability::ProviderCapabilities::default(),
            calls: AtomicUsize::new(0),
        });

        let first = ChatResponse {
            content: "starting".into(),
            tool_calls: vec![],
            usage: None,
            model: "scripted".into(),
            finish_reason: Some("incomplete".into()),
            thinking: None,
        };

        let result = continue_incomplete(&ctx, &provider, &[Message::user("go")], &[], first).await;
        assert_eq!(result.content, "starting more done.");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn continue_incomplete_stops_at_the_configured_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = make_context("s4", tmp.path());
        ctx.config.max_continuations = 1;
        struct AlwaysIncompleteProvider {
            capabilities: ad_domain::capability::ProviderCapabilities,
        }
        #[async_trait::async_trait]
        impl LlmProvider for AlwaysIncompleteProvider {
            async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse> {
                Ok(ChatResponse {
                    content: " more".into(),
                    tool_calls: vec![],
                    usage: None,
                    model: "scripted".into(),
                    finish_reason: Some("incomplete".into()),
                    thinking: None,
                })
            }
            async fn chat_stream(&self, _req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
                unimplemented!("not used by this test")
            }
            fn capabilities(&self) -> &ad_domain::capability::ProviderCapabilities {
                &self.capabilities
            }
            fn provider_id(&self) -> &str {
                "always-incomplete"
            }
        }
        let provider: Arc<dyn LlmProvider> =
            Arc::new(AlwaysIncompleteProvider { capabilities: ad_domain::capability::ProviderCapabilities::default() });

        let first = ChatResponse {
            content: "starting".into(),
            tool_calls: vec![],
            usage: None,
            model: "scripted".into(),
            finish_reason: Some("incomplete".into()),
            thinking: None,
        };

        let result = continue_incomplete(&ctx, &provider, &[Message::user("go")], &[], first).await;
        // One continuation attempt allowed; still incomplete, but stops looping.
        assert_eq!(result.content, "starting more");
        assert_eq!(result.finish_reason.as_deref(), Some("incomplete"));
    }
}
