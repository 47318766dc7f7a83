//! Event/Hook Registry (C1) — ordered, prioritised fan-out of named events.
//!
//! Handlers are registered per event name with a priority (lower fires
//! earlier) and run in (priority ascending, insertion order). Each
//! handler's [`HookResult`] is folded by [`ad_domain::event::reduce`]
//! into a single [`HookOutcome`] with `deny > modify > inject_context >
//! continue` precedence.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ad_domain::event::{reduce, ContextInjection, HookOutcome, HookResult};
use parking_lot::RwLock;
use serde_json::{Map, Value};

/// `content` is redacted from the stream overlay for injections marked
/// `suppress_output` — the provider still sees it, clients watching the
/// SSE feed don't.
fn redact_injection_for_overlay(injection: &ContextInjection) -> Value {
    if injection.suppress_output {
        serde_json::json!({
            "content": "<suppressed>",
            "role": injection.role,
            "ephemeral": injection.ephemeral,
            "append_to_last_tool_result": injection.append_to_last_tool_result,
            "suppress_output": true,
        })
    } else {
        serde_json::to_value(injection).unwrap_or(Value::Null)
    }
}

/// The fixed event-name universe the registry understands out of the box.
/// Additional names may be emitted freely — this list only seeds the
/// streaming overlay's default "interesting" set.
pub const EVENT_UNIVERSE: &[&str] = &[
    "session:start",
    "session:end",
    "session:resume",
    "prompt:submit",
    "prompt:complete",
    "plan:start",
    "plan:end",
    "provider:request",
    "provider:response",
    "provider:error",
    "provider:tool_sequence_repaired",
    "provider:incomplete_continuation",
    "llm:request",
    "llm:response",
    "llm:request:debug",
    "llm:response:debug",
    "llm:request:raw",
    "llm:response:raw",
    "tool:pre",
    "tool:post",
    "tool:error",
    "tool:selecting",
    "tool:selected",
    "thinking:delta",
    "thinking:final",
    "context:pre_compact",
    "context:post_compact",
    "context:include",
    "artifact:write",
    "artifact:read",
    "policy:violation",
    "approval:required",
    "approval:granted",
    "approval:denied",
    "content_block:start",
    "content_block:delta",
    "content_block:end",
    "orchestrator:complete",
];

type HandlerFuture = Pin<Box<dyn Future<Output = HookResult> + Send>>;
type HandlerFn = dyn Fn(Map<String, Value>) -> HandlerFuture + Send + Sync;

struct HandlerEntry {
    id: u64,
    name: String,
    priority: i32,
    seq: u64,
    handler: Arc<HandlerFn>,
}

/// Identifies a registered handler so it can later be unregistered.
#[derive(Debug, Clone)]
pub struct HookHandle {
    pub event_name: String,
    pub id: u64,
    pub name: String,
}

/// Fires before/after an event's handlers run, publishing `hook:<name>`
/// and `hook:<name>:result` frames for the streaming overlay. Failures
/// are logged only — they never change the reduced [`HookOutcome`].
pub trait StreamEmitter: Send + Sync {
    fn publish(&self, event_name: &str, payload: Value);
}

pub struct HookRegistry {
    handlers: RwLock<HashMap<String, Vec<HandlerEntry>>>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
    stream_events: RwLock<HashSet<String>>,
    stream_emitter: RwLock<Option<Arc<dyn StreamEmitter>>>,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
            stream_events: RwLock::new(EVENT_UNIVERSE.iter().map(|s| s.to_string()).collect()),
            stream_emitter: RwLock::new(None),
        }
    }

    pub fn set_stream_emitter(&self, emitter: Arc<dyn StreamEmitter>) {
        *self.stream_emitter.write() = Some(emitter);
    }

    /// Register a handler for `event_name`. Lower `priority` fires
    /// earlier; ties break on registration order.
    pub fn register<F, Fut>(&self, event_name: &str, priority: i32, name: &str, handler: F) -> HookHandle
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = HandlerEntry {
            id,
            name: name.to_owned(),
            priority,
            seq,
            handler: Arc::new(move |data| Box::pin(handler(data))),
        };

        let mut handlers = self.handlers.write();
        let list = handlers.entry(event_name.to_owned()).or_default();
        list.push(entry);
        list.sort_by_key(|e| (e.priority, e.seq));

        HookHandle { event_name: event_name.to_owned(), id, name: name.to_owned() }
    }

    /// Remove a previously registered handler. Missing handles are a no-op.
    pub fn unregister(&self, handle: &HookHandle) {
        if let Some(list) = self.handlers.write().get_mut(&handle.event_name) {
            list.retain(|e| e.id != handle.id);
        }
    }

    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers.read().get(event_name).map(|v| v.len()).unwrap_or(0)
    }

    /// Run every handler registered for `event_name`, in priority order,
    /// and fold their results into one [`HookOutcome`].
    ///
    /// Handlers see a payload that reflects prior handlers' `modify`
    /// results within the same `emit` call — the registry applies each
    /// `modify` to its working copy before invoking the next handler, per
    /// the "modify accumulates in handler order" rule.
    pub async fn emit(&self, event_name: &str, data: Map<String, Value>) -> HookOutcome {
        let entries: Vec<(Arc<HandlerFn>, String)> = {
            let handlers = self.handlers.read();
            handlers
                .get(event_name)
                .map(|list| list.iter().map(|e| (e.handler.clone(), e.name.clone())).collect())
                .unwrap_or_default()
        };

        self.publish_overlay(event_name, "", &data);

        let mut working = data;
        let mut results = Vec::with_capacity(entries.len());
        for (handler, handler_name) in &entries {
            let result = run_handler_safely(handler.clone(), working.clone(), handler_name).await;
            if let HookResult::Modify { data: ref patch, .. } = result {
                for (k, v) in patch {
                    working.insert(k.clone(), v.clone());
                }
            }
            results.push(result);
        }

        let outcome = reduce(&results);
        self.publish_result_overlay(event_name, &outcome);
        outcome
    }

    fn publish_overlay(&self, event_name: &str, _phase: &str, data: &Map<String, Value>) {
        if !self.stream_events.read().contains(event_name) {
            return;
        }
        if let Some(emitter) = self.stream_emitter.read().as_ref() {
            emitter.publish(&format!("hook:{event_name}"), Value::Object(data.clone()));
        }
    }

    fn publish_result_overlay(&self, event_name: &str, outcome: &HookOutcome) {
        if !self.stream_events.read().contains(event_name) {
            return;
        }
        if let Some(emitter) = self.stream_emitter.read().as_ref() {
            let payload = match outcome {
                HookOutcome::Allowed { injected, .. } => {
                    let injected: Vec<Value> = injected.iter().map(redact_injection_for_overlay).collect();
                    serde_json::json!({ "action": "allowed", "injected": injected })
                }
                HookOutcome::Denied { reason } => {
                    serde_json::json!({ "action": "denied", "reason": reason })
                }
            };
            emitter.publish(&format!("hook:{event_name}:result"), payload);
        }
    }
}

/// Lets the tool-invocation contract (`ad_tools::invoke_tool_call`) drive
/// this registry through the crate-agnostic `HookEmitter` seam without the
/// tools crate knowing how hooks are registered or prioritised.
#[async_trait::async_trait]
impl ad_tools::HookEmitter for HookRegistry {
    async fn emit(&self, event_name: &str, data: Map<String, Value>) -> HookOutcome {
        HookRegistry::emit(self, event_name, data).await
    }
}

/// Invoke a handler, catching both panics and the future timing out into
/// `HookResult::Continue` — a misbehaving hook must never break the
/// pipeline.
async fn run_handler_safely(handler: Arc<HandlerFn>, data: Map<String, Value>, name: &str) -> HookResult {
    let fut = handler(data);
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(join_err) => {
            tracing::debug!(hook = name, error = %join_err, "hook handler panicked, treating as continue");
            HookResult::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtOrdering};

    #[tokio::test]
    async fn emit_with_no_handlers_is_allowed() {
        let registry = HookRegistry::new();
        let outcome = registry.emit("tool:pre", Map::new()).await;
        assert!(!outcome.is_denied());
    }

    #[tokio::test]
    async fn handlers_run_in_priority_order() {
        let registry = HookRegistry::new();
        let order = Arc::new(RwLock::new(Vec::<&'static str>::new()));

        let o1 = order.clone();
        registry.register("tool:pre", 10, "second", move |_| {
            let o = o1.clone();
            async move {
                o.write().push("second");
                HookResult::Continue
            }
        });
        let o2 = order.clone();
        registry.register("tool:pre", 1, "first", move |_| {
            let o = o2.clone();
            async move {
                o.write().push("first");
                HookResult::Continue
            }
        });

        registry.emit("tool:pre", Map::new()).await;
        assert_eq!(*order.read(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn first_deny_short_circuits_reduction_but_all_handlers_still_run() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        registry.register("tool:pre", 0, "denier", |_| async {
            HookResult::Deny { reason: "blocked".into() }
        });
        let c = calls.clone();
        registry.register("tool:pre", 1, "logger", move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, AtOrdering::SeqCst);
                HookResult::Continue
            }
        });

        let outcome = registry.emit("tool:pre", Map::new()).await;
        assert!(outcome.is_denied());
        assert_eq!(calls.load(AtOrdering::SeqCst), 1, "later handlers still run for audit");
    }

    #[tokio::test]
    async fn modify_accumulates_and_is_visible_to_later_handlers() {
        let registry = HookRegistry::new();

        registry.register("provider:request", 0, "first", |_| async {
            let mut data = Map::new();
            data.insert("iteration".into(), Value::from(1));
            HookResult::Modify { data, reason: None }
        });
        registry.register("provider:request", 1, "second", |data| async move {
            // Sees the first handler's patch already applied.
            assert_eq!(data.get("iteration"), Some(&Value::from(1)));
            let mut patch = Map::new();
            patch.insert("iteration".into(), Value::from(2));
            HookResult::Modify { data: patch, reason: None }
        });

        let outcome = registry.emit("provider:request", Map::new()).await;
        match outcome {
            HookOutcome::Allowed { data_override: Some(d), .. } => {
                assert_eq!(d.get("iteration"), Some(&Value::from(2)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn panicking_handler_is_treated_as_continue() {
        let registry = HookRegistry::new();
        registry.register("tool:pre", 0, "panics", |_| async { panic!("boom") });
        let outcome = registry.emit("tool:pre", Map::new()).await;
        assert!(!outcome.is_denied());
    }

    #[tokio::test]
    async fn unregister_removes_handler() {
        let registry = HookRegistry::new();
        let handle = registry.register("tool:pre", 0, "transient", |_| async { HookResult::Deny { reason: "x".into() } });
        assert_eq!(registry.handler_count("tool:pre"), 1);
        registry.unregister(&handle);
        assert_eq!(registry.handler_count("tool:pre"), 0);
        let outcome = registry.emit("tool:pre", Map::new()).await;
        assert!(!outcome.is_denied());
    }

    struct CapturingEmitter {
        events: Arc<RwLock<Vec<String>>>,
    }

    impl StreamEmitter for CapturingEmitter {
        fn publish(&self, event_name: &str, _payload: Value) {
            self.events.write().push(event_name.to_owned());
        }
    }

    #[tokio::test]
    async fn streaming_overlay_publishes_pre_and_post_frames() {
        let registry = HookRegistry::new();
        let events = Arc::new(RwLock::new(Vec::new()));
        registry.set_stream_emitter(Arc::new(CapturingEmitter { events: events.clone() }));

        registry.emit("tool:pre", Map::new()).await;

        let captured = events.read().clone();
        assert_eq!(captured, vec!["hook:tool:pre", "hook:tool:pre:result"]);
    }

    struct PayloadCapturingEmitter {
        payloads: Arc<RwLock<Vec<Value>>>,
    }

    impl StreamEmitter for PayloadCapturingEmitter {
        fn publish(&self, event_name: &str, payload: Value) {
            if event_name.ends_with(":result") {
                self.payloads.write().push(payload);
            }
        }
    }

    #[tokio::test]
    async fn suppressed_injection_content_is_redacted_in_overlay() {
        let registry = HookRegistry::new();
        let payloads = Arc::new(RwLock::new(Vec::new()));
        registry.set_stream_emitter(Arc::new(PayloadCapturingEmitter { payloads: payloads.clone() }));

        registry.register("provider:request", 0, "secret-injector", |_| async {
            ad_domain::event::HookResult::InjectContext {
                content: "do not leak this".into(),
                reason: None,
                role: ad_domain::event::ContextInjectionRole::System,
                ephemeral: true,
                append_to_last_tool_result: false,
                suppress_output: true,
            }
        });

        registry.emit("provider:request", Map::new()).await;

        let captured = payloads.read().clone();
        let injected = captured[0]["injected"][0]["content"].as_str().unwrap().to_string();
        assert_eq!(injected, "<suppressed>");
    }
}
