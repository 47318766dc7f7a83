//! Informational discovery endpoints: what providers, tools, and hooks a
//! session can be mounted with. No store of its own — reads the static
//! vocabulary [`crate::mount_plan`] defines and the live [`ProviderRegistry`].

use std::sync::Arc;

use axum::extract::State;
use axum::response::{IntoResponse, Json};

use crate::mount_plan::ToolMount;
use crate::state::AppState;

const TOOL_NAMES: &[ToolMount] = &[
    ToolMount::Exec,
    ToolMount::Process,
    ToolMount::FileRead,
    ToolMount::FileWrite,
    ToolMount::FileAppend,
    ToolMount::FileMove,
    ToolMount::FileDelete,
    ToolMount::FileList,
];

const HOOK_KINDS: &[&str] = &["deny_tool_prefix", "tool_policy", "approval_gate"];

/// `GET /discovery/providers` — providers configured for this daemon,
/// plus any that failed to initialize (without leaking their error detail
/// beyond what [`ad_providers::ProviderRegistry`] already redacts).
pub async fn list_providers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let init_errors: Vec<serde_json::Value> = state
        .providers
        .init_errors()
        .iter()
        .map(|e| serde_json::json!({ "provider_id": e.provider_id, "kind": e.kind, "error": e.error }))
        .collect();
    Json(serde_json::json!({
        "providers": state.providers.list_providers(),
        "init_errors": init_errors,
    }))
}

/// `GET /discovery/tools` — the built-in tool vocabulary mount plans may
/// reference. This daemon has no plugin tools, per spec.md's Non-goals.
pub async fn list_tools() -> impl IntoResponse {
    let names: Vec<String> = TOOL_NAMES
        .iter()
        .filter_map(|t| serde_json::to_value(t).ok())
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    Json(serde_json::json!({ "tools": names }))
}

/// `GET /discovery/hooks` — the built-in hook-kind vocabulary a mount
/// plan's `HookMount::kind` may select.
pub async fn list_hook_kinds() -> impl IntoResponse {
    Json(serde_json::json!({ "hook_kinds": HOOK_KINDS }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_domain::config::{Config, LlmConfig};
    use ad_providers::ProviderRegistry;
    use axum::extract::State as AxState;

    fn state(tmp: &std::path::Path) -> Arc<AppState> {
        let config = Arc::new(Config::default());
        let providers = Arc::new(ProviderRegistry::from_config(&LlmConfig::default()).unwrap());
        Arc::new(AppState::new(config, providers, tmp.to_path_buf()).unwrap())
    }

    #[tokio::test]
    async fn list_providers_reports_empty_registry() {
        let tmp = tempfile::tempdir().unwrap();
        let app = state(tmp.path());
        let resp = list_providers(AxState(app)).await.into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn list_tools_lists_every_builtin() {
        let resp = list_tools().await.into_response();
        assert_eq!(resp.status(), axum::http::StatusCode::OK);
    }
}
