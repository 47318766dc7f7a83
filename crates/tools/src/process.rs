//! Process tool — inspect and control background sessions started by `exec`.
//!
//! Actions: list, poll, log, write, kill, clear, remove. All but `list`
//! and `clear` operate on a single session and require `session_id`.

use serde::{Deserialize, Serialize};

use crate::manager::ProcessManager;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request / Response
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessRequest {
    pub action: ProcessAction,
    /// Session ID (required for all actions except `list` and `clear`).
    #[serde(default)]
    pub session_id: Option<String>,
    /// For `poll`: byte offset to read from.
    #[serde(default)]
    pub offset: Option<usize>,
    /// For `log`: byte limit.
    #[serde(default)]
    pub limit: Option<usize>,
    /// For `log`: number of tail lines (default 200).
    #[serde(default)]
    pub tail_lines: Option<usize>,
    /// For `write`: data to send to stdin.
    #[serde(default)]
    pub data: Option<String>,
    /// For `write`: close stdin after sending.
    #[serde(default)]
    pub eof: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessAction {
    List,
    Poll,
    Log,
    Write,
    Kill,
    Clear,
    Remove,
}

impl ProcessAction {
    fn name(&self) -> &'static str {
        match self {
            Self::List => "list",
            Self::Poll => "poll",
            Self::Log => "log",
            Self::Write => "write",
            Self::Kill => "kill",
            Self::Clear => "clear",
            Self::Remove => "remove",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProcessResponse {
    fn ok(data: serde_json::Value) -> Self {
        Self { success: true, error: None, data: Some(data) }
    }

    fn ok_empty() -> Self {
        Self { success: true, error: None, data: None }
    }

    fn err(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()), data: None }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Execute a process management action against the running/finished
/// sessions tracked by `manager`.
pub async fn handle_process(manager: &ProcessManager, req: ProcessRequest) -> ProcessResponse {
    // `list` and `clear` are the only actions that don't target one
    // specific session; resolve `session_id` up front for the rest.
    let session_id = match req.action {
        ProcessAction::List | ProcessAction::Clear => None,
        action => match &req.session_id {
            Some(s) => Some(s.as_str()),
            None => return ProcessResponse::err(format!("session_id required for {}", action.name())),
        },
    };

    match req.action {
        ProcessAction::List => {
            let sessions = manager.list();
            ProcessResponse::ok(serde_json::json!({ "sessions": sessions, "count": sessions.len() }))
        }

        ProcessAction::Poll => {
            let sid = session_id.expect("resolved above");
            match manager.poll(sid, req.offset.unwrap_or(0)) {
                Some(result) => ProcessResponse::ok(serde_json::to_value(result).unwrap_or_default()),
                None => ProcessResponse::err("session not found"),
            }
        }

        ProcessAction::Log => {
            let sid = session_id.expect("resolved above");
            match manager.log(sid, req.offset, req.limit, req.tail_lines) {
                Some(log) => ProcessResponse::ok(serde_json::json!({ "log": log })),
                None => ProcessResponse::err("session not found"),
            }
        }

        ProcessAction::Write => {
            let sid = session_id.expect("resolved above");
            let data = req.data.unwrap_or_default().into_bytes();
            if manager.write_stdin(sid, data, req.eof).await {
                ProcessResponse::ok_empty()
            } else {
                ProcessResponse::err("session not found or stdin closed")
            }
        }

        ProcessAction::Kill => {
            let sid = session_id.expect("resolved above");
            if manager.kill(sid) {
                ProcessResponse::ok_empty()
            } else {
                ProcessResponse::err("session not found or not running")
            }
        }

        ProcessAction::Clear => {
            let cleared = manager.clear_finished();
            ProcessResponse::ok(serde_json::json!({ "cleared": cleared }))
        }

        ProcessAction::Remove => {
            let sid = session_id.expect("resolved above");
            if manager.remove(sid) {
                ProcessResponse::ok_empty()
            } else {
                ProcessResponse::err("session not found")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_domain::config::ExecConfig;

    fn req(action: ProcessAction) -> ProcessRequest {
        ProcessRequest {
            action,
            session_id: None,
            offset: None,
            limit: None,
            tail_lines: None,
            data: None,
            eof: false,
        }
    }

    #[tokio::test]
    async fn list_on_empty_manager_reports_zero() {
        let manager = ProcessManager::new(ExecConfig::default());
        let resp = handle_process(&manager, req(ProcessAction::List)).await;
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["count"], 0);
    }

    #[tokio::test]
    async fn poll_without_session_id_is_rejected() {
        let manager = ProcessManager::new(ExecConfig::default());
        let resp = handle_process(&manager, req(ProcessAction::Poll)).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap(), "session_id required for poll");
    }

    #[tokio::test]
    async fn poll_unknown_session_reports_not_found() {
        let manager = ProcessManager::new(ExecConfig::default());
        let mut r = req(ProcessAction::Poll);
        r.session_id = Some("does-not-exist".into());
        let resp = handle_process(&manager, r).await;
        assert!(!resp.success);
        assert_eq!(resp.error.unwrap(), "session not found");
    }

    #[tokio::test]
    async fn clear_on_empty_manager_clears_nothing() {
        let manager = ProcessManager::new(ExecConfig::default());
        let resp = handle_process(&manager, req(ProcessAction::Clear)).await;
        assert!(resp.success);
        assert_eq!(resp.data.unwrap()["cleared"], 0);
    }
}
