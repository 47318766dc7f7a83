//! Anthropic-native adapter.
//!
//! Implements the Anthropic Messages API including tool use, streaming, and
//! the Anthropic-specific message structure where system messages go in a
//! separate top-level `system` field. Also the one adapter that can round-trip
//! extended-thinking blocks, since Anthropic is the provider this daemon was
//! built against for that feature.

use crate::http::from_reqwest;
use crate::auth::resolve_api_key;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use ad_domain::capability::ProviderCapabilities;
use ad_domain::config::ProviderConfig;
use ad_domain::error::{Error, Result};
use ad_domain::message::{ContentBlock, Message, MessageContent, Role, ToolCall, ToolSpec};
use ad_domain::stream::{BoxStream, StreamEvent, Usage};
use serde_json::Value;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Headroom added on top of a thinking budget so the model has room left
/// to write its actual answer after spending the budget on reasoning.
const DEFAULT_THINKING_BUFFER_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    capabilities: ProviderCapabilities,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let api_key = resolve_api_key(&cfg.auth)?;
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "claude-sonnet-4-20250514".into());

        let capabilities = ProviderCapabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_thinking: true,
            context_window_tokens: Some(200_000),
            max_output_tokens: Some(8_192),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self { id: cfg.id.clone(), base_url: cfg.base_url.trim_end_matches('/').to_string(), api_key, default_model, capabilities, client })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let model = req.model.clone().unwrap_or_else(|| self.default_model.clone());

        let mut system_parts: Vec<String> = Vec::new();
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &req.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.extract_all_text()),
                Role::User => api_messages.push(user_msg_to_anthropic(msg)),
                Role::Assistant => api_messages.push(assistant_msg_to_anthropic(msg)),
                Role::Tool => api_messages.push(tool_result_to_anthropic(msg)),
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "stream": stream,
        });

        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n\n"));
        }
        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            body["tools"] = Value::Array(tools);
        }
        let max_tokens = if let Some(budget) = req.thinking_budget_tokens {
            let effort = req.reasoning_effort.clone().unwrap_or_else(|| "high".to_string());
            body["thinking"] = serde_json::json!({"type": "enabled", "budget_tokens": budget, "effort": effort});
            // Anthropic requires temperature unset when thinking is enabled.
            req.max_tokens.unwrap_or(1024).max(budget + DEFAULT_THINKING_BUFFER_TOKENS)
        } else {
            if let Some(temp) = req.temperature {
                body["temperature"] = serde_json::json!(temp);
            }
            req.max_tokens.unwrap_or(4096)
        };
        body["max_tokens"] = serde_json::json!(max_tokens);

        body
    }
}

// ── Message serialization ───────────────────────────────────────────

fn user_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({"role": "user", "content": t}),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentBlock::Text { text } => Some(serde_json::json!({"type": "text", "text": text})),
                    ContentBlock::Image { url, media_type } => {
                        let mt = media_type.as_deref().unwrap_or("image/png");
                        Some(serde_json::json!({"type": "image", "source": {"type": "base64", "media_type": mt, "data": url}}))
                    }
                    _ => None,
                })
                .collect();
            serde_json::json!({"role": "user", "content": content})
        }
    }
}

fn assistant_msg_to_anthropic(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({"role": "assistant", "content": [{"type": "text", "text": t}]}),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts
                .iter()
                .filter_map(|p| match p {
                    ContentBlock::Text { text } => Some(serde_json::json!({"type": "text", "text": text})),
                    ContentBlock::ToolUse { id, name, input } => {
                        Some(serde_json::json!({"type": "tool_use", "id": id, "name": name, "input": input}))
                    }
                    // Replaying a prior turn's thinking block is what lets Anthropic
                    // skip re-deriving it, and is required when tool use follows it.
                    ContentBlock::Thinking { encrypted, reasoning_id } => Some(serde_json::json!({
                        "type": "thinking",
                        "thinking": encrypted,
                        "signature": reasoning_id.clone().unwrap_or_default(),
                    })),
                    _ => None,
                })
                .collect();
            serde_json::json!({"role": "assistant", "content": content})
        }
    }
}

fn tool_result_to_anthropic(msg: &Message) -> Value {
    let content: Vec<Value> = match &msg.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentBlock::ToolResult { tool_use_id, content, is_error } => Some(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                })),
                _ => None,
            })
            .collect(),
        MessageContent::Text(t) => vec![serde_json::json!({"type": "tool_result", "tool_use_id": "", "content": t})],
    };
    serde_json::json!({"role": "user", "content": content})
}

fn tool_to_anthropic(tool: &ToolSpec) -> Value {
    serde_json::json!({"name": tool.name, "description": tool.description, "input_schema": tool.parameters})
}

// ── Response deserialization ────────────────────────────────────────

fn parse_anthropic_response(body: &Value) -> Result<ChatResponse> {
    let content_arr = body.get("content").and_then(|v| v.as_array()).cloned().unwrap_or_default();

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut thinking: Option<ContentBlock> = None;

    for block in &content_arr {
        let block_type = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match block_type {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let tool_name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let arguments = block.get("input").cloned().unwrap_or(Value::Object(Default::default()));
                tool_calls.push(ToolCall { call_id, tool_name, arguments });
            }
            "thinking" => {
                let encrypted = block.get("thinking").and_then(|v| v.as_str()).unwrap_or("").to_string();
                let reasoning_id = block.get("signature").and_then(|v| v.as_str()).map(String::from);
                thinking = Some(ContentBlock::Thinking { encrypted, reasoning_id });
            }
            _ => {}
        }
    }

    let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
    let finish_reason = body.get("stop_reason").and_then(|v| v.as_str()).map(map_stop_reason);
    let usage = body.get("usage").and_then(parse_anthropic_usage);

    Ok(ChatResponse { content: text_parts.join(""), tool_calls, usage, model, finish_reason, thinking })
}

/// Anthropic's `stop_reason` vocabulary mapped onto the daemon's
/// provider-agnostic `finish_reason` strings. `max_tokens` becomes
/// `incomplete` so the orchestrator's continuation loop can recognize it.
fn map_stop_reason(s: &str) -> String {
    match s {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        "max_tokens" => "incomplete".to_string(),
        other => other.to_string(),
    }
}

fn parse_anthropic_usage(v: &Value) -> Option<Usage> {
    let input = v.get("input_tokens")?.as_u64()? as u32;
    let output = v.get("output_tokens")?.as_u64()? as u32;
    Some(Usage { prompt_tokens: input, completion_tokens: output, total_tokens: input + output })
}

// ── Streaming SSE ────────────────────────────────────────────────────

struct StreamState {
    active_tool_calls: std::collections::HashMap<u64, (String, String, String)>,
    active_thinking_block: Option<u64>,
    usage: Option<Usage>,
    done_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self { active_tool_calls: std::collections::HashMap::new(), active_thinking_block: None, usage: None, done_emitted: false }
    }
}

fn parse_anthropic_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    let event_type = v.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").and_then(parse_anthropic_usage);
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                let block_type = block.get("type").and_then(|v| v.as_str()).unwrap_or("");
                if block_type == "tool_use" {
                    let call_id = block.get("id").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    events.push(Ok(StreamEvent::ToolCallStarted { call_id: call_id.clone(), tool_name: name.clone() }));
                    state.active_tool_calls.insert(idx, (call_id, name, String::new()));
                } else if block_type == "thinking" {
                    state.active_thinking_block = Some(idx);
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                let delta_type = delta.get("type").and_then(|v| v.as_str()).unwrap_or("");
                match delta_type {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                events.push(Ok(StreamEvent::Token { text: text.to_string() }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if state.active_thinking_block == Some(idx) {
                            if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    events.push(Ok(StreamEvent::ThinkingDelta { delta: text.to_string() }));
                                }
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(tc) = state.active_tool_calls.get_mut(&idx) {
                                tc.2.push_str(partial);
                                events.push(Ok(StreamEvent::ToolCallDelta { call_id: tc.0.clone(), delta: partial.to_string() }));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if state.active_thinking_block == Some(idx) {
                state.active_thinking_block = None;
            }
            if let Some((call_id, tool_name, args_str)) = state.active_tool_calls.remove(&idx) {
                let arguments: Value = serde_json::from_str(&args_str).unwrap_or(Value::Object(Default::default()));
                events.push(Ok(StreamEvent::ToolCallFinished { call_id, tool_name, arguments }));
            }
        }

        "message_delta" => {
            if let Some(usage_val) = v.get("usage") {
                if let Some(output) = usage_val.get("output_tokens").and_then(|v| v.as_u64()) {
                    if let Some(ref mut u) = state.usage {
                        u.completion_tokens = output as u32;
                        u.total_tokens = u.prompt_tokens + u.completion_tokens;
                    }
                }
            }
            let stop_reason = v.get("delta").and_then(|d| d.get("stop_reason")).and_then(|v| v.as_str()).map(map_stop_reason);
            if stop_reason.is_some() {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done { usage: state.usage.clone(), finish_reason: stop_reason }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done { usage: state.usage.clone(), finish_reason: Some("stop".into()) }));
            }
        }

        "error" => {
            let msg = v.get("error").and_then(|e| e.get("message")).and_then(|v| v.as_str()).unwrap_or("unknown error");
            events.push(Ok(StreamEvent::Error { message: msg.to_string() }));
        }

        _ => {}
    }

    events
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, false);

        tracing::debug!(provider = %self.id, url = %url, "anthropic chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider { provider: self.id.clone(), message: format!("HTTP {} - {}", status.as_u16(), resp_text) });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_anthropic_response(&resp_json)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "anthropic stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider { provider: provider_id, message: format!("HTTP {} - {}", status.as_u16(), err_text) });
        }

        let mut state = StreamState::new();
        Ok(crate::sse::sse_response_stream(resp, move |data| parse_anthropic_sse(data, &mut state)))
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}
