//! OpenAI-compatible adapter. Works with OpenAI, Ollama, vLLM, LM Studio,
//! Together, and any other endpoint that follows the OpenAI chat
//! completions contract.

use crate::auth;
use crate::http::from_reqwest;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};
use ad_domain::capability::ProviderCapabilities;
use ad_domain::config::ProviderConfig;
use ad_domain::error::{Error, Result};
use ad_domain::message::{ContentBlock, Message, MessageContent, Role, ToolCall, ToolSpec};
use ad_domain::stream::{BoxStream, StreamEvent, Usage};
use serde_json::Value;

/// Mirrors the Anthropic adapter's headroom so a thinking-enabled request
/// against an OpenAI-compatible reasoning model doesn't get truncated
/// before it finishes reasoning.
const DEFAULT_THINKING_BUFFER_TOKENS: u32 = 1024;

pub struct OpenAiCompatProvider {
    id: String,
    base_url: String,
    auth_header: Option<(String, String)>,
    default_model: String,
    capabilities: ProviderCapabilities,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn from_config(cfg: &ProviderConfig) -> Result<Self> {
        let auth_header = auth::build_header(&cfg.auth)?;
        let default_model = cfg.default_model.clone().unwrap_or_else(|| "gpt-4o".into());

        let capabilities = ProviderCapabilities {
            supports_tools: true,
            supports_streaming: true,
            supports_thinking: false,
            context_window_tokens: Some(128_000),
            max_output_tokens: Some(16_384),
        };

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            id: cfg.id.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            auth_header,
            default_model,
            capabilities,
            client,
        })
    }

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self.client.post(url).header("Content-Type", "application/json");
        if let Some((name, value)) = &self.auth_header {
            builder = builder.header(name, value);
        }
        builder
    }

    fn effective_model(&self, req: &ChatRequest) -> String {
        req.model.clone().unwrap_or_else(|| self.default_model.clone())
    }

    fn build_chat_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let messages: Vec<Value> = req.messages.iter().map(msg_to_openai).collect();

        let mut body = serde_json::json!({
            "model": self.effective_model(req),
            "messages": messages,
            "stream": stream,
        });

        if !req.tools.is_empty() {
            let tools: Vec<Value> = req.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = req.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(budget) = req.thinking_budget_tokens {
            let max_tokens = req.max_tokens.unwrap_or(1024).max(budget + DEFAULT_THINKING_BUFFER_TOKENS);
            body["max_tokens"] = serde_json::json!(max_tokens);
            let effort = req.reasoning_effort.clone().unwrap_or_else(|| "high".to_string());
            body["reasoning_effort"] = serde_json::json!(effort);
        } else if let Some(max) = req.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
            if let Some(effort) = &req.reasoning_effort {
                body["reasoning_effort"] = serde_json::json!(effort);
            }
        }
        if req.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }
        if stream {
            body["stream_options"] = serde_json::json!({"include_usage": true});
        }
        body
    }
}

// ── Message serialization ───────────────────────────────────────────

fn role_to_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn msg_to_openai(msg: &Message) -> Value {
    match msg.role {
        Role::Tool => tool_result_to_openai(msg),
        Role::Assistant => assistant_to_openai(msg),
        _ => serde_json::json!({
            "role": role_to_str(msg.role),
            "content": msg.content.extract_all_text(),
        }),
    }
}

fn assistant_to_openai(msg: &Message) -> Value {
    let mut obj = serde_json::json!({"role": "assistant"});
    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    match &msg.content {
        MessageContent::Text(t) => text_parts.push(t.clone()),
        MessageContent::Parts(parts) => {
            for part in parts {
                match part {
                    ContentBlock::Text { text } => text_parts.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_calls.push(serde_json::json!({
                            "id": id,
                            "type": "function",
                            "function": { "name": name, "arguments": input.to_string() },
                        }));
                    }
                    // OpenAI-compat has no wire representation for a replayed
                    // thinking block; it is only preserved in our own transcript.
                    ContentBlock::Thinking { .. } | ContentBlock::ToolResult { .. } | ContentBlock::Image { .. } => {}
                }
            }
        }
    }

    obj["content"] = if text_parts.is_empty() { Value::Null } else { Value::String(text_parts.join("\n")) };
    if !tool_calls.is_empty() {
        obj["tool_calls"] = Value::Array(tool_calls);
    }
    obj
}

fn tool_result_to_openai(msg: &Message) -> Value {
    match &msg.content {
        MessageContent::Parts(parts) => {
            for part in parts {
                if let ContentBlock::ToolResult { tool_use_id, content, .. } = part {
                    return serde_json::json!({ "role": "tool", "tool_call_id": tool_use_id, "content": content });
                }
            }
            serde_json::json!({"role": "tool", "tool_call_id": "", "content": ""})
        }
        MessageContent::Text(t) => serde_json::json!({"role": "tool", "tool_call_id": "", "content": t}),
    }
}

fn tool_to_openai(tool: &ToolSpec) -> Value {
    serde_json::json!({
        "type": "function",
        "function": { "name": tool.name, "description": tool.description, "parameters": tool.parameters },
    })
}

// ── Response deserialization ────────────────────────────────────────

fn parse_chat_response(body: &Value) -> Result<ChatResponse> {
    let choice = body
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .ok_or_else(|| Error::Provider { provider: "openai_compat".into(), message: "no choices in response".into() })?;

    let message = choice
        .get("message")
        .ok_or_else(|| Error::Provider { provider: "openai_compat".into(), message: "no message in choice".into() })?;

    let content = message.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let finish_reason = choice.get("finish_reason").and_then(|v| v.as_str()).map(map_finish_reason);
    let model = body.get("model").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
    let tool_calls = parse_openai_tool_calls(message);
    let usage = body.get("usage").and_then(parse_openai_usage);

    Ok(ChatResponse { content, tool_calls, usage, model, finish_reason, thinking: None })
}

/// `length` means the backend's own max-tokens cap cut the response off
/// mid-stream, the OpenAI-compat analogue of Anthropic's `max_tokens` stop
/// reason. Map it to the provider-agnostic value the orchestrator checks
/// for before resubmitting.
fn map_finish_reason(s: &str) -> String {
    match s {
        "length" => "incomplete".to_string(),
        other => other.to_string(),
    }
}

fn parse_openai_tool_calls(message: &Value) -> Vec<ToolCall> {
    let arr = match message.get("tool_calls").and_then(|v| v.as_array()) {
        Some(a) => a,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|tc| {
            let call_id = tc.get("id")?.as_str()?.to_string();
            let func = tc.get("function")?;
            let tool_name = func.get("name")?.as_str()?.to_string();
            let args_str = func.get("arguments")?.as_str().unwrap_or("{}");
            let arguments: Value = serde_json::from_str(args_str).unwrap_or(Value::Object(Default::default()));
            Some(ToolCall { call_id, tool_name, arguments })
        })
        .collect()
}

fn parse_openai_usage(v: &Value) -> Option<Usage> {
    Some(Usage {
        prompt_tokens: v.get("prompt_tokens")?.as_u64()? as u32,
        completion_tokens: v.get("completion_tokens")?.as_u64()? as u32,
        total_tokens: v.get("total_tokens")?.as_u64()? as u32,
    })
}

// ── SSE streaming ────────────────────────────────────────────────────

fn parse_sse_data(data: &str) -> Option<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return None;
    }
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(Error::Json(e))),
    };

    let choice = v.get("choices").and_then(|c| c.as_array()).and_then(|a| a.first());

    if choice.is_none() {
        return v.get("usage").and_then(parse_openai_usage).map(|usage| Ok(StreamEvent::Done { usage: Some(usage), finish_reason: None }));
    }
    let choice = choice?;
    let delta = choice.get("delta").unwrap_or(&Value::Null);

    if let Some(fr) = choice.get("finish_reason").and_then(|f| f.as_str()) {
        let usage = v.get("usage").and_then(parse_openai_usage);
        return Some(Ok(StreamEvent::Done { usage, finish_reason: Some(map_finish_reason(fr)) }));
    }

    if let Some(tc_arr) = delta.get("tool_calls").and_then(|v| v.as_array()) {
        for tc in tc_arr {
            let idx_str = tc.get("index").and_then(|v| v.as_u64()).unwrap_or(0).to_string();
            if let Some(id) = tc.get("id").and_then(|v| v.as_str()) {
                let name = tc.get("function").and_then(|f| f.get("name")).and_then(|v| v.as_str()).unwrap_or("");
                return Some(Ok(StreamEvent::ToolCallStarted { call_id: id.to_string(), tool_name: name.to_string() }));
            }
            if let Some(args) = tc.get("function").and_then(|f| f.get("arguments")).and_then(|v| v.as_str()) {
                return Some(Ok(StreamEvent::ToolCallDelta { call_id: idx_str, delta: args.to_string() }));
            }
        }
    }

    if let Some(text) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            return Some(Ok(StreamEvent::ThinkingDelta { delta: text.to_string() }));
        }
    }

    if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
        if !text.is_empty() {
            return Some(Ok(StreamEvent::Token { text: text.to_string() }));
        }
    }

    None
}

fn parse_sse_data_vec(data: &str) -> Vec<Result<StreamEvent>> {
    if data.trim() == "[DONE]" {
        return vec![Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) })];
    }
    parse_sse_data(data).into_iter().collect()
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait::async_trait]
impl LlmProvider for OpenAiCompatProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, false);

        tracing::debug!(provider = %self.id, url = %url, "openai_compat chat request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let resp_text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(Error::Provider { provider: self.id.clone(), message: format!("HTTP {} - {}", status.as_u16(), resp_text) });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_chat_response(&resp_json)
    }

    async fn chat_stream(&self, req: ChatRequest) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "openai_compat stream request");

        let resp = self.authed_post(&url).json(&body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(from_reqwest)?;
            return Err(Error::Provider { provider: provider_id, message: format!("HTTP {} - {}", status.as_u16(), err_text) });
        }

        Ok(crate::sse::sse_response_stream(resp, parse_sse_data_vec))
    }

    fn capabilities(&self) -> &ProviderCapabilities {
        &self.capabilities
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat_response_extracts_content_and_usage() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{"message": {"content": "hi there"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 3, "total_tokens": 13},
        });
        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.content, "hi there");
        assert_eq!(resp.finish_reason.as_deref(), Some("stop"));
        assert_eq!(resp.usage.unwrap().total_tokens, 13);
    }

    #[test]
    fn parse_chat_response_maps_length_finish_reason_to_incomplete() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{"message": {"content": "cut off"}, "finish_reason": "length"}],
        });
        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.finish_reason.as_deref(), Some("incomplete"));
    }

    #[test]
    fn parse_chat_response_missing_choices_errors() {
        let body = serde_json::json!({});
        assert!(parse_chat_response(&body).is_err());
    }

    #[test]
    fn parse_chat_response_extracts_tool_calls() {
        let body = serde_json::json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "call_1", "function": {"name": "exec", "arguments": "{\"cmd\":\"ls\"}"}}],
                },
                "finish_reason": "tool_calls",
            }],
        });
        let resp = parse_chat_response(&body).unwrap();
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].tool_name, "exec");
    }

    #[test]
    fn sse_data_done_sentinel_emits_done() {
        let events = parse_sse_data_vec("[DONE]");
        assert!(matches!(events.as_slice(), [Ok(StreamEvent::Done { .. })]));
    }

    #[test]
    fn sse_data_token_delta_emits_token() {
        let data = serde_json::json!({"choices": [{"delta": {"content": "hel"}}]}).to_string();
        let events = parse_sse_data_vec(&data);
        assert!(matches!(events.as_slice(), [Ok(StreamEvent::Token { text })] if text == "hel"));
    }

    #[test]
    fn sse_data_tool_call_started_on_id_present() {
        let data = serde_json::json!({
            "choices": [{"delta": {"tool_calls": [{"index": 0, "id": "c1", "function": {"name": "exec"}}]}}]
        })
        .to_string();
        let events = parse_sse_data_vec(&data);
        assert!(matches!(events.as_slice(), [Ok(StreamEvent::ToolCallStarted { call_id, tool_name })] if call_id == "c1" && tool_name == "exec"));
    }

    #[test]
    fn thinking_budget_raises_max_tokens_and_sets_reasoning_effort() {
        let provider = test_provider();
        let req = ChatRequest { thinking_budget_tokens: Some(6000), max_tokens: Some(1024), ..ChatRequest::default() };
        let body = provider.build_chat_body(&req, false);
        assert_eq!(body["max_tokens"], 7024);
        assert_eq!(body["reasoning_effort"], "high");
    }

    #[test]
    fn reasoning_effort_override_is_forwarded_without_thinking_budget() {
        let provider = test_provider();
        let req = ChatRequest { max_tokens: Some(512), reasoning_effort: Some("low".into()), ..ChatRequest::default() };
        let body = provider.build_chat_body(&req, false);
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["reasoning_effort"], "low");
    }

    fn test_provider() -> OpenAiCompatProvider {
        OpenAiCompatProvider {
            id: "test".into(),
            base_url: "https://example.invalid".into(),
            auth_header: None,
            default_model: "gpt-4o".into(),
            capabilities: ProviderCapabilities::default(),
            client: reqwest::Client::new(),
        }
    }

    #[test]
    fn assistant_message_with_thinking_block_drops_it_from_wire_body() {
        let msg = Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![
                ContentBlock::Thinking { encrypted: "opaque".into(), reasoning_id: None },
                ContentBlock::Text { text: "answer".into() },
            ]),
        };
        let json = msg_to_openai(&msg);
        assert_eq!(json["content"], "answer");
    }
}
