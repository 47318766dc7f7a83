//! Session lifecycle endpoints: create, list, get, transcript, append
//! a message without running a turn.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;

use super::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default = "default_profile")]
    pub profile_id: String,
}

fn default_profile() -> String {
    "default".into()
}

pub async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.create_session(&req.profile_id)?;
    Ok(Json(session))
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({ "sessions": state.sessions.list() }))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse + std::fmt::Debug, ApiError> {
    Ok(Json(state.require_session(&session_id)?))
}

#[derive(Debug, Deserialize)]
pub struct AppendMessageRequest {
    pub content: String,
}

/// `POST /sessions/:id/messages` — persist only, per spec.md §4.9. Does
/// not drive a turn or touch the session lock.
pub async fn append_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<AppendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.append_user_message(&session_id, req.content)?;
    Ok(Json(serde_json::json!({ "status": "saved" })))
}

pub async fn get_transcript(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.require_session(&session_id)?;
    let lines = state.get_transcript(&session_id)?;
    Ok(Json(serde_json::json!({ "session_id": session_id, "transcript": lines })))
}
