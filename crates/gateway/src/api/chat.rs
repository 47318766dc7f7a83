//! Turn-execution and stream endpoints.
//!
//! - `POST /sessions/:id/execute` — drives one turn, streaming every event
//!   back over SSE until the turn completes.
//! - `POST /sessions/:id/messages/send` — fire-and-forget; events go to
//!   whoever is already subscribed to `/sessions/:id/stream`.
//! - `GET  /sessions/:id/stream` — subscribe to a session's event feed.
//! - `GET  /events` — subscribe to the daemon-wide event feed.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use futures_util::stream::Stream;
use serde::Deserialize;

use super::error::ApiError;
use crate::runtime::stream_manager::Subscription;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

fn subscription_stream(mut sub: Subscription) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(event) = sub.next().await {
            let data = serde_json::to_string(&event.data).unwrap_or_default();
            yield Ok(Event::default().event(event.event).data(data));
        }
    }
}

/// `POST /sessions/:id/execute` — streams the turn synchronously: the
/// subscription is opened before the turn is spawned so no event between
/// `user_message_saved` and the turn's end is missed.
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let subscription = state.execute_sync(&session_id, req.content)?;
    Ok(Sse::new(subscription_stream(subscription)).keep_alive(KeepAlive::default()))
}

/// `POST /sessions/:id/messages/send` — HTTP 202; the turn runs in the
/// background and its events land on the session's persistent stream.
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse + std::fmt::Debug, ApiError> {
    state.send_message(&session_id, req.content)?;
    Ok((axum::http::StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "accepted" }))))
}

/// `GET /sessions/:id/stream` — subscribe to an existing or not-yet-created
/// session's event feed. Does not require the session to have run a turn.
pub async fn session_stream(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.require_session(&session_id)?;
    let manager = state.streams.get_or_create(&session_id);
    Ok(Sse::new(subscription_stream(manager.subscribe())).keep_alive(KeepAlive::default()))
}

/// `GET /events` — daemon-wide event feed (session lifecycle, automation
/// firings) per spec.md §4.9's global stream subscription.
pub async fn daemon_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Sse::new(subscription_stream(state.daemon_events.subscribe())).keep_alive(KeepAlive::default())
}

/// `POST /sessions/:id/cancel` — stops the next loop iteration of a
/// running turn. A no-op (200, `cancelled: false`) if the session has no
/// turn in flight.
pub async fn cancel_turn(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<impl IntoResponse + std::fmt::Debug, ApiError> {
    state.require_session(&session_id)?;
    let cancelled = state.cancel_turn(&session_id);
    Ok(Json(serde_json::json!({ "cancelled": cancelled })))
}
