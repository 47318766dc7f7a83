pub mod approvals;
pub mod auth;
pub mod automations;
pub mod chat;
pub mod discovery;
pub mod error;
pub mod sessions;

use std::sync::Arc;

use axum::extract::State;
use axum::middleware;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router.
///
/// Routes split into **public** (health probe, daemon-wide event stream —
/// no auth required) and **protected** (gated behind the bearer-token
/// middleware, a no-op when `config.server.api_token_env` is unset).
pub fn router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let public = Router::new()
        .route("/healthz", get(health))
        .route("/events", get(chat::daemon_stream));

    let protected = Router::new()
        // Sessions
        .route("/sessions", post(sessions::create_session))
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/:id", get(sessions::get_session))
        .route("/sessions/:id/messages", post(sessions::append_message))
        .route("/sessions/:id/transcript", get(sessions::get_transcript))
        // Turn execution and streaming
        .route("/sessions/:id/execute", post(chat::execute))
        .route("/sessions/:id/messages/send", post(chat::send_message))
        .route("/sessions/:id/stream", get(chat::session_stream))
        .route("/sessions/:id/cancel", post(chat::cancel_turn))
        // Automations
        .route("/automations", get(automations::list_automations))
        .route("/automations", post(automations::create_automation))
        .route("/automations/:id", get(automations::get_automation))
        .route("/automations/:id", axum::routing::put(automations::update_automation))
        .route("/automations/:id", axum::routing::delete(automations::delete_automation))
        .route("/automations/:id/toggle", post(automations::toggle_automation))
        .route("/automations/:id/executions", get(automations::execution_history))
        // Approvals
        .route("/approvals", get(approvals::list_pending))
        .route("/approvals/:id/approve", post(approvals::approve))
        .route("/approvals/:id/deny", post(approvals::deny))
        // Discovery
        .route("/discovery/providers", get(discovery::list_providers))
        .route("/discovery/tools", get(discovery::list_tools))
        .route("/discovery/hooks", get(discovery::list_hook_kinds))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_api_token));

    public.merge(protected).layer(tower_http::trace::TraceLayer::new_for_http())
}

/// `GET /healthz` — liveness probe plus a light runtime snapshot:
/// sessions with a turn lock tracked vs. actually running, and how many
/// exec approvals are awaiting a human decision.
async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.session_locks.prune_idle();
    Json(serde_json::json!({
        "status": "ok",
        "sessions_tracked": state.session_locks.session_count(),
        "sessions_running": state.session_locks.running_count(),
        "approvals_pending": state.approvals.list_pending().len(),
    }))
}
