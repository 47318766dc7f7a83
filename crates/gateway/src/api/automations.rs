//! Automation CRUD, toggle, and execution history, scoped per project.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use uuid::Uuid;

use super::error::{api_error, ApiError};
use crate::scheduler::{Automation, ExecutionStatus, ScheduleConfig};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ProjectFilter {
    pub project_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateAutomationRequest {
    pub project_id: String,
    pub name: String,
    pub message: String,
    pub schedule: ScheduleConfig,
}

pub async fn list_automations(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ProjectFilter>,
) -> impl IntoResponse {
    Json(serde_json::json!({ "automations": state.automations.list(filter.project_id.as_deref()) }))
}

pub async fn get_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.automations.require(&id)?))
}

pub async fn create_automation(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAutomationRequest>,
) -> impl IntoResponse {
    if req.name.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "name must not be empty");
    }
    if let Err(msg) = req.schedule.validate() {
        return api_error(StatusCode::BAD_REQUEST, msg);
    }
    if state.automations.name_exists_in_project(&req.project_id, &req.name, None) {
        return api_error(StatusCode::CONFLICT, format!("automation named '{}' already exists in this project", req.name));
    }

    let id = format!("auto_{}", Uuid::new_v4().simple());
    let automation = Automation::new(id, req.project_id, req.name, req.message, req.schedule);
    match state.automations.insert(automation) {
        Ok(automation) => (StatusCode::CREATED, Json(automation)).into_response(),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateAutomationRequest {
    pub name: Option<String>,
    pub message: Option<String>,
    pub schedule: Option<ScheduleConfig>,
}

pub async fn update_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateAutomationRequest>,
) -> impl IntoResponse {
    let existing = match state.automations.get(&id) {
        Some(a) => a,
        None => return api_error(StatusCode::NOT_FOUND, format!("automation '{id}' not found")),
    };

    if let Some(name) = &req.name {
        if state.automations.name_exists_in_project(&existing.project_id, name, Some(&id)) {
            return api_error(StatusCode::CONFLICT, format!("automation named '{name}' already exists in this project"));
        }
    }
    if let Some(schedule) = &req.schedule {
        if let Err(msg) = schedule.validate() {
            return api_error(StatusCode::BAD_REQUEST, msg);
        }
    }

    let result = state.automations.update(&id, |a| {
        if let Some(name) = req.name {
            a.name = name;
        }
        if let Some(message) = req.message {
            a.message = message;
        }
        if let Some(schedule) = req.schedule {
            a.schedule = schedule;
        }
    });
    match result {
        Ok(Some(automation)) => Json(automation).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("automation '{id}' not found")),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn delete_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.automations.delete(&id) {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, format!("automation '{id}' not found")),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `POST /automations/:id/toggle` — flips `enabled`; the scheduler's poll
/// loop picks the new state up on its next tick.
pub async fn toggle_automation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.automations.update(&id, |a| a.enabled = !a.enabled) {
        Ok(Some(automation)) => Json(automation).into_response(),
        Ok(None) => api_error(StatusCode::NOT_FOUND, format!("automation '{id}' not found")),
        Err(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

pub async fn execution_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse + std::fmt::Debug, ApiError> {
    state.automations.require(&id)?;
    let history = state.automations.executions(&id);
    let succeeded = history.iter().filter(|r| r.status == ExecutionStatus::Success).count();
    Ok(Json(serde_json::json!({ "automation_id": id, "executions": history, "succeeded": succeeded })))
}
