//! Session & Stream Manager (C6) — per-session SSE fan-out.
//!
//! One [`StreamManager`] per live session multiplexes orchestrator turn
//! events to any number of subscribers (SSE clients). Fan-out rides on
//! `tokio::sync::broadcast`, which already drops the oldest buffered event
//! for a subscriber that falls behind rather than blocking the writer —
//! exactly the backpressure policy this daemon wants. A lagging subscriber
//! sees a synthetic `stream:dropped` event in place of whatever it missed.
//!
//! Single-writer exclusivity per session (at most one turn running at a
//! time) is enforced by the caller via [`super::session_lock::SessionLockMap`];
//! this module only owns fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::orchestrator::{self, TurnContext, TurnEvent};
use crate::hooks::StreamEmitter;

/// One SSE event as delivered to subscribers: an event-type name plus its
/// JSON payload. The HTTP layer renders this as `event: <event>\ndata: <json>\n\n`.
#[derive(Debug, Clone, Serialize)]
pub struct StreamEvent {
    pub event: String,
    pub data: serde_json::Value,
}

fn turn_event_to_stream_event(session_id: &str, event: &TurnEvent) -> StreamEvent {
    match event {
        TurnEvent::UserMessageSaved => StreamEvent {
            event: "user_message_saved".into(),
            data: serde_json::json!({ "session_id": session_id }),
        },
        TurnEvent::AssistantMessageStart => StreamEvent {
            event: "assistant_message_start".into(),
            data: serde_json::json!({ "session_id": session_id }),
        },
        TurnEvent::Content { text } => StreamEvent {
            event: "content".into(),
            data: serde_json::json!({ "text": text }),
        },
        TurnEvent::AssistantMessageComplete { content } => StreamEvent {
            event: "assistant_message_complete".into(),
            data: serde_json::json!({ "content": content }),
        },
        TurnEvent::ExecutionError { message } => StreamEvent {
            event: "execution_error".into(),
            data: serde_json::json!({ "message": message }),
        },
        TurnEvent::Done { status } => StreamEvent {
            event: "message".into(),
            data: serde_json::json!({ "type": "done", "status": status }),
        },
    }
}

/// Per-session fan-out point. Cheap to hold onto; the broadcast channel's
/// buffer is the only real allocation.
pub struct StreamManager {
    session_id: String,
    tx: broadcast::Sender<StreamEvent>,
}

/// A subscriber's view onto a [`StreamManager`]. Wraps the raw broadcast
/// receiver so a lag (the subscriber fell behind and lost buffered events)
/// surfaces as one `stream:dropped` event instead of silently skipping.
pub struct Subscription {
    session_id: String,
    inner: broadcast::Receiver<StreamEvent>,
}

impl Subscription {
    pub async fn next(&mut self) -> Option<StreamEvent> {
        match self.inner.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(session_id = %self.session_id, skipped, "stream subscriber lagged, dropping oldest events");
                Some(StreamEvent {
                    event: "stream:dropped".into(),
                    data: serde_json::json!({ "skipped": skipped }),
                })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

impl StreamManager {
    pub fn new(session_id: impl Into<String>, queue_depth: usize) -> Self {
        let (tx, _rx) = broadcast::channel(queue_depth.max(1));
        Self { session_id: session_id.into(), tx }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Number of live subscribers. Used by the registry to decide whether
    /// a manager with no in-flight turn can be collected.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription { session_id: self.session_id.clone(), inner: self.tx.subscribe() }
    }

    fn publish_event(&self, event: StreamEvent) {
        // No receivers is not an error — a manager may run a turn before
        // anyone has subscribed.
        let _ = self.tx.send(event);
    }

    /// Run one turn to completion, forwarding every orchestrator event onto
    /// this manager's broadcast channel in the order the orchestrator
    /// produced them, plus the hook registry's `hook:<name>`/`hook:<name>:result`
    /// overlay (spec.md §4.9's event-type list). Returns once `Done` has
    /// been forwarded.
    pub async fn drive_turn(self: &Arc<Self>, ctx: TurnContext, prompt: String) {
        ctx.coordinator.hooks.set_stream_emitter(self.clone());
        let mut rx = orchestrator::run_turn(ctx, prompt);
        while let Some(event) = rx.recv().await {
            let done = matches!(event, TurnEvent::Done { .. });
            self.publish_event(turn_event_to_stream_event(&self.session_id, &event));
            if done {
                break;
            }
        }
    }

    /// `send_message` semantics: spawn the turn in the background and
    /// return immediately. Callers needing the SSE response itself to be
    /// the turn's stream (`execute_sync`) should call [`Self::drive_turn`]
    /// directly and hold a [`Subscription`] opened before calling it.
    pub fn spawn_turn(self: &Arc<Self>, ctx: TurnContext, prompt: String) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.drive_turn(ctx, prompt).await;
        });
    }
}

impl StreamEmitter for StreamManager {
    fn publish(&self, event_name: &str, payload: Value) {
        self.publish_event(StreamEvent { event: event_name.to_string(), data: payload });
    }
}

/// Daemon-wide event stream, independent of any one session. Carries
/// lifecycle events (`session:created`, `automation:fired`, ...) to
/// subscribers of the global event feed (spec.md §4.9's "subscribe to a
/// global event stream"). Same broadcast-plus-drop-oldest shape as
/// [`StreamManager`], just without a per-session scope.
pub struct DaemonEventBus {
    tx: broadcast::Sender<StreamEvent>,
}

impl DaemonEventBus {
    pub fn new(queue_depth: usize) -> Self {
        let (tx, _rx) = broadcast::channel(queue_depth.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: impl Into<String>, data: serde_json::Value) {
        let _ = self.tx.send(StreamEvent { event: event.into(), data });
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription { session_id: "*".into(), inner: self.tx.subscribe() }
    }
}

/// Owns every session's [`StreamManager`], created lazily on first use.
pub struct StreamManagerRegistry {
    managers: Mutex<HashMap<String, Arc<StreamManager>>>,
    queue_depth: usize,
}

impl StreamManagerRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self { managers: Mutex::new(HashMap::new()), queue_depth }
    }

    pub fn get_or_create(&self, session_id: &str) -> Arc<StreamManager> {
        self.managers
            .lock()
            .entry(session_id.to_owned())
            .or_insert_with(|| Arc::new(StreamManager::new(session_id, self.queue_depth)))
            .clone()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<StreamManager>> {
        self.managers.lock().get(session_id).cloned()
    }

    /// Drop managers with zero live subscribers. Call periodically; a
    /// manager mid-turn with no subscribers is still safe to collect since
    /// `drive_turn` only needs `self` by reference for the duration of the
    /// call, not a registry entry.
    pub fn collect_idle(&self) {
        self.managers.lock().retain(|_, m| m.subscriber_count() > 0);
    }

    pub fn session_count(&self) -> usize {
        self.managers.lock().len()
    }
}
