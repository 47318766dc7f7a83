//! Human-in-the-loop exec approval endpoints.
//!
//! - `GET  /approvals` — list every approval currently awaiting a decision.
//! - `POST /approvals/:id/approve` — let the gated command proceed.
//! - `POST /approvals/:id/deny` — block it, with an optional reason.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use super::error::api_error;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct DenyRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// `GET /approvals` — pending approvals across every session, newest and
/// oldest mixed (the store keeps no ordering beyond insertion).
pub async fn list_pending(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "approvals": state.approvals.list_pending() }))
}

/// `POST /approvals/:id/approve`
pub async fn approve(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> impl IntoResponse {
    if state.approvals.approve(&id) {
        Json(serde_json::json!({ "approved": true })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, format!("approval '{id}' not found or already resolved"))
    }
}

/// `POST /approvals/:id/deny`
pub async fn deny(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<DenyRequest>>,
) -> impl IntoResponse {
    let reason = body.and_then(|Json(req)| req.reason);
    if state.approvals.deny(&id, reason) {
        Json(serde_json::json!({ "denied": true })).into_response()
    } else {
        api_error(StatusCode::NOT_FOUND, format!("approval '{id}' not found or already resolved"))
    }
}
