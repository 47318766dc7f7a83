//! API authentication middleware.
//!
//! `AppState::api_token` is read once at startup from the env var named
//! by `config.server.api_token_env`. Unset or empty = dev mode: protected
//! routes require no `Authorization` header at all.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};

use crate::state::AppState;

pub async fn require_api_token(State(state): State<Arc<AppState>>, req: Request<Body>, next: Next) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(req).await;
    };

    let provided = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");

    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "invalid or missing API token" })))
            .into_response();
    }

    next.run(req).await
}

/// Compares two byte strings without short-circuiting on the first
/// mismatch, so response latency doesn't leak how many leading bytes of
/// the token the caller guessed correctly.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
