//! Exec approval gate — pauses a matching tool call until a human approves
//! or denies it via the REST API, or the configured timeout elapses.
//!
//! Every resolution (approved, denied, or timed out) is appended to the
//! approval audit log, per spec.md §5's "timeout → synthetic deny ...
//! plus audit entry" — the audit trail covers every decision path, not
//! just timeouts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::persistence::append_jsonl;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The decision made by a human reviewer.
#[derive(Debug)]
pub enum ApprovalDecision {
    Approved,
    Denied { reason: Option<String> },
}

/// A pending approval waiting for human review.
pub struct PendingApproval {
    pub id: Uuid,
    pub command: String,
    pub session_key: String,
    pub created_at: DateTime<Utc>,
    pub respond: oneshot::Sender<ApprovalDecision>,
}

/// Serializable snapshot of a pending approval (for API responses / SSE events).
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub command: String,
    pub session_key: String,
    pub created_at: DateTime<Utc>,
}

impl From<&PendingApproval> for ApprovalInfo {
    fn from(p: &PendingApproval) -> Self {
        Self {
            id: p.id,
            command: p.command.clone(),
            session_key: p.session_key.clone(),
            created_at: p.created_at,
        }
    }
}

/// One line of the approval audit log.
#[derive(Debug, Clone, Serialize)]
struct ApprovalAuditRecord {
    id: Uuid,
    session_key: String,
    command: String,
    decision: &'static str,
    reason: Option<String>,
    decided_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thread-safe store for pending exec approvals.
///
/// Each approval is associated with a `oneshot::Sender` that unblocks the
/// waiting `dispatch_exec` call when resolved.
pub struct ApprovalStore {
    pending: RwLock<HashMap<Uuid, PendingApproval>>,
    timeout: Duration,
    audit_log_path: PathBuf,
}

impl ApprovalStore {
    /// Create a new store with the given approval timeout and audit log path.
    pub fn new(timeout: Duration, audit_log_path: PathBuf) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
            audit_log_path,
        }
    }

    /// The configured approval timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Insert a pending approval. Returns the serializable info snapshot.
    pub fn insert(&self, approval: PendingApproval) -> ApprovalInfo {
        let info = ApprovalInfo::from(&approval);
        self.pending.write().insert(approval.id, approval);
        info
    }

    /// Resolve a pending approval as approved. Returns `true` if found.
    pub fn approve(&self, id: &Uuid) -> bool {
        let Some(pending) = self.pending.write().remove(id) else { return false };
        self.audit(&pending, "approved", None);
        let _ = pending.respond.send(ApprovalDecision::Approved);
        true
    }

    /// Resolve a pending approval as denied. Returns `true` if found.
    pub fn deny(&self, id: &Uuid, reason: Option<String>) -> bool {
        let Some(pending) = self.pending.write().remove(id) else { return false };
        self.audit(&pending, "denied", reason.clone());
        let _ = pending.respond.send(ApprovalDecision::Denied { reason });
        true
    }

    /// Remove a timed-out approval (called when the receiver times out).
    pub fn remove_expired(&self, id: &Uuid) {
        if let Some(pending) = self.pending.write().remove(id) {
            self.audit(&pending, "timed_out", Some("Approval request timed out".into()));
        }
    }

    /// List all currently pending approvals (for dashboard introspection).
    pub fn list_pending(&self) -> Vec<ApprovalInfo> {
        self.pending
            .read()
            .values()
            .map(ApprovalInfo::from)
            .collect()
    }

    fn audit(&self, pending: &PendingApproval, decision: &'static str, reason: Option<String>) {
        let record = ApprovalAuditRecord {
            id: pending.id,
            session_key: pending.session_key.clone(),
            command: pending.command.clone(),
            decision,
            reason,
            decided_at: Utc::now(),
        };
        if let Err(e) = append_jsonl(&self.audit_log_path, &record) {
            tracing::warn!(approval_id = %pending.id, error = %e, "failed to write approval audit entry");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> ApprovalStore {
        make_store_at(tempfile::tempdir().unwrap().into_path().join("approvals.jsonl"))
    }

    fn make_store_at(audit_log_path: PathBuf) -> ApprovalStore {
        ApprovalStore::new(Duration::from_secs(300), audit_log_path)
    }

    fn make_pending() -> (PendingApproval, oneshot::Receiver<ApprovalDecision>) {
        let (tx, rx) = oneshot::channel();
        let pending = PendingApproval {
            id: Uuid::new_v4(),
            command: "rm -rf /tmp/test".into(),
            session_key: "sk_test".into(),
            created_at: Utc::now(),
            respond: tx,
        };
        (pending, rx)
    }

    #[test]
    fn insert_and_list() {
        let store = make_store();
        let (pending, _rx) = make_pending();
        let id = pending.id;
        store.insert(pending);

        let list = store.list_pending();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
    }

    #[tokio::test]
    async fn approve_resolves_channel() {
        let store = make_store();
        let (pending, rx) = make_pending();
        let id = pending.id;
        store.insert(pending);

        assert!(store.approve(&id));
        let decision = rx.await.unwrap();
        assert!(matches!(decision, ApprovalDecision::Approved));
        assert!(store.list_pending().is_empty());
    }

    #[tokio::test]
    async fn deny_resolves_channel() {
        let store = make_store();
        let (pending, rx) = make_pending();
        let id = pending.id;
        store.insert(pending);

        assert!(store.deny(&id, Some("too dangerous".into())));
        let decision = rx.await.unwrap();
        match decision {
            ApprovalDecision::Denied { reason } => {
                assert_eq!(reason.as_deref(), Some("too dangerous"));
            }
            _ => panic!("expected Denied"),
        }
    }

    #[test]
    fn approve_nonexistent_returns_false() {
        let store = make_store();
        assert!(!store.approve(&Uuid::new_v4()));
    }

    #[test]
    fn deny_nonexistent_returns_false() {
        let store = make_store();
        assert!(!store.deny(&Uuid::new_v4(), None));
    }

    #[test]
    fn remove_expired() {
        let store = make_store();
        let (pending, _rx) = make_pending();
        let id = pending.id;
        store.insert(pending);

        store.remove_expired(&id);
        assert!(store.list_pending().is_empty());
    }

    #[test]
    fn timeout_returns_configured_duration() {
        let tmp = tempfile::tempdir().unwrap();
        let store = make_store_at(tmp.path().join("approvals.jsonl"));
        assert_eq!(store.timeout(), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn approve_writes_an_audit_record() {
        let tmp = tempfile::tempdir().unwrap();
        let audit_path = tmp.path().join("approvals.jsonl");
        let store = make_store_at(audit_path.clone());
        let (pending, _rx) = make_pending();
        let id = pending.id;
        store.insert(pending);
        store.approve(&id);

        let logged = std::fs::read_to_string(&audit_path).unwrap();
        assert!(logged.contains("\"decision\":\"approved\""));
    }

    #[test]
    fn remove_expired_writes_a_timed_out_audit_record() {
        let tmp = tempfile::tempdir().unwrap();
        let audit_path = tmp.path().join("approvals.jsonl");
        let store = make_store_at(audit_path.clone());
        let (pending, _rx) = make_pending();
        let id = pending.id;
        store.insert(pending);
        store.remove_expired(&id);

        let logged = std::fs::read_to_string(&audit_path).unwrap();
        assert!(logged.contains("\"decision\":\"timed_out\""));
        assert!(logged.contains("Approval request timed out"));
    }
}
