//! Module Coordinator (C2) — owns the mounted modules for one session:
//! providers, tools, the hook registry, and a free-form capability
//! registry modules use to advertise optional features (e.g. the
//! `observability.events` capability that seeds additional streaming
//! hook names).

use std::collections::HashMap;
use std::sync::Arc;

use ad_domain::event::HookOutcome;
use ad_domain::trace::TraceEvent;
use ad_providers::ProviderRegistry;
use ad_tools::ToolRegistry;
use parking_lot::RwLock;
use serde_json::Value;

use crate::hooks::HookRegistry;

/// The set of modules mounted into one session's coordinator. Built once
/// by the mount-plan loader (C8) and shared read-mostly for the
/// session's lifetime.
pub struct Coordinator {
    pub providers: Arc<ProviderRegistry>,
    pub tools: Arc<ToolRegistry>,
    pub hooks: Arc<HookRegistry>,
    capabilities: RwLock<HashMap<String, Value>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator").finish()
    }
}

impl Coordinator {
    pub fn new(providers: Arc<ProviderRegistry>, tools: Arc<ToolRegistry>, hooks: Arc<HookRegistry>) -> Self {
        Self { providers, tools, hooks, capabilities: RwLock::new(HashMap::new()) }
    }

    pub fn register_capability(&self, name: impl Into<String>, value: Value) {
        self.capabilities.write().insert(name.into(), value);
    }

    pub fn get_capability(&self, name: &str) -> Option<Value> {
        self.capabilities.read().get(name).cloned()
    }

    pub fn capability_names(&self) -> Vec<String> {
        self.capabilities.read().keys().cloned().collect()
    }

    /// Apply C1's reduced result into session-level bookkeeping. The
    /// actual deny/modify/inject_context semantics on the in-flight turn
    /// are applied by the orchestrator (which holds the turn's mutable
    /// state); this hook exists so the coordinator can observe denials
    /// for audit/trace purposes regardless of which caller triggered them.
    pub fn process_hook_result(&self, event_name: &str, outcome: HookOutcome) -> HookOutcome {
        if let HookOutcome::Denied { ref reason } = outcome {
            TraceEvent::HookDenied {
                event_name: event_name.to_owned(),
                hook_name: "reduced".into(),
                reason: reason.clone(),
            }
            .emit();
        }
        outcome
    }
}
