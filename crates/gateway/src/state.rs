//! Shared application state wired to every HTTP handler.
//!
//! `AppState` owns the process-wide services (config, providers, session
//! store, stream fan-out, automations) and the operations that stitch them
//! together: creating a session writes its immutable mount plan, sending a
//! message builds a fresh `Coordinator` from that plan and drives one
//! orchestrator turn under the session's run lock.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ad_domain::config::Config;
use ad_domain::error::{Error, Result};
use ad_providers::ProviderRegistry;
use ad_sessions::{Session, SessionStatus, SessionStore, TranscriptLine, TranscriptWriter};
use uuid::Uuid;

use crate::mount_plan::{self, MountPlan};
use crate::persistence::atomic_write_json;
use crate::runtime::approval::ApprovalStore;
use crate::runtime::cancel::CancelMap;
use crate::runtime::orchestrator::TurnContext;
use crate::runtime::session_lock::SessionLockMap;
use crate::runtime::stream_manager::{DaemonEventBus, StreamManager, StreamManagerRegistry, Subscription};
use crate::scheduler::{AutomationStore, FireRequest};

pub struct AppState {
    pub config: Arc<Config>,
    pub providers: Arc<ProviderRegistry>,
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptWriter>,
    pub session_locks: Arc<SessionLockMap>,
    pub cancel_map: Arc<CancelMap>,
    pub streams: Arc<StreamManagerRegistry>,
    pub approvals: Arc<ApprovalStore>,
    pub automations: Arc<AutomationStore>,
    pub daemon_events: Arc<DaemonEventBus>,
    /// Bearer token read from the env var named by `config.server.api_token_env`.
    /// `None` means dev mode — protected routes require no auth.
    pub api_token: Option<String>,
    pub data_root: PathBuf,
}

impl AppState {
    pub fn new(config: Arc<Config>, providers: Arc<ProviderRegistry>, data_root: PathBuf) -> Result<Self> {
        let sessions = Arc::new(SessionStore::new(&data_root)?);
        let transcripts = Arc::new(TranscriptWriter::new(&data_root.join("sessions")));
        let automations = Arc::new(AutomationStore::new(data_root.clone())?);
        let approvals = Arc::new(ApprovalStore::new(
            Duration::from_millis(config.approval.timeout_ms),
            data_root.join(&config.approval.audit_log_path),
        ));
        let queue_depth = config.sessions.subscriber_queue_depth;
        let api_token = config
            .server
            .api_token_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty());
        if api_token.is_none() && config.server.api_token_env.is_some() {
            tracing::warn!("SA_API_TOKEN env var named by server.api_token_env is unset — running without auth");
        }

        Ok(Self {
            config,
            providers,
            sessions,
            transcripts,
            session_locks: Arc::new(SessionLockMap::new()),
            cancel_map: Arc::new(CancelMap::new()),
            streams: Arc::new(StreamManagerRegistry::new(queue_depth)),
            approvals,
            automations,
            daemon_events: Arc::new(DaemonEventBus::new(queue_depth)),
            api_token,
            data_root,
        })
    }

    /// Create a session from a profile's default mount plan, writing the
    /// plan once to `sessions/<id>/mount_plan.json` — immutable thereafter.
    pub fn create_session(&self, profile_id: &str) -> Result<Session> {
        let id = format!("sess_{}", Uuid::new_v4().simple());
        let workspace_dir = self.data_root.join("workspace").join(&id);
        std::fs::create_dir_all(&workspace_dir)?;

        let plan = MountPlan::default_for_workspace(profile_id, workspace_dir);
        let mount_plan_path = self.sessions.session_path(&id).join("mount_plan.json");
        atomic_write_json(&mount_plan_path, &plan)?;

        let session = self.sessions.create(id, profile_id.to_string(), mount_plan_path)?;
        self.daemon_events.publish(
            "session:created",
            serde_json::json!({ "session_id": session.id, "profile_id": session.profile_id }),
        );
        Ok(session)
    }

    fn turn_context_for(&self, session: &Session) -> Result<TurnContext> {
        let raw = std::fs::read_to_string(&session.mount_plan_path)?;
        let plan: MountPlan = serde_json::from_str(&raw)?;
        let coordinator =
            Arc::new(mount_plan::load(&plan, self.providers.clone(), &self.config.tools.exec, self.approvals.clone(), &session.id)?);
        let cancel = self.cancel_map.register(&session.id);
        Ok(TurnContext {
            coordinator,
            transcript: self.transcripts.clone(),
            session_id: session.id.clone(),
            config: plan.orchestrator,
            provider_id: None,
            cancel,
        })
    }

    /// Signals cancellation for a session's in-flight turn, if any.
    /// Returns `false` if no turn is currently running.
    pub fn cancel_turn(&self, session_id: &str) -> bool {
        self.cancel_map.cancel(session_id)
    }

    pub fn get_transcript(&self, session_id: &str) -> Result<Vec<TranscriptLine>> {
        self.transcripts.read(session_id)
    }

    fn spawn_locked_turn(self: &Arc<Self>, manager: Arc<StreamManager>, session_id: String, ctx: TurnContext, content: String) {
        let state = self.clone();
        tokio::spawn(async move {
            let _permit = match state.session_locks.acquire(&session_id).await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let _ = state.sessions.set_status(&session_id, SessionStatus::Running);
            manager.drive_turn(ctx, content).await;
            state.cancel_map.remove(&session_id);
            let _ = state.sessions.set_status(&session_id, SessionStatus::Idle);
        });
    }

    /// `send_message` (C6): fire-and-forget. Returns immediately; events go
    /// to whoever is already subscribed to this session's stream.
    pub fn send_message(self: &Arc<Self>, session_id: &str, content: String) -> Result<()> {
        let session = self.require_session(session_id)?;
        let manager = self.streams.get_or_create(session_id);
        let ctx = self.turn_context_for(&session)?;
        self.spawn_locked_turn(manager, session_id.to_string(), ctx, content);
        Ok(())
    }

    /// `execute_sync` (C6): subscribes before the turn starts so the caller
    /// observes every event from `user_message_saved` onward.
    pub fn execute_sync(self: &Arc<Self>, session_id: &str, content: String) -> Result<Subscription> {
        let session = self.require_session(session_id)?;
        let manager = self.streams.get_or_create(session_id);
        let subscription = manager.subscribe();
        let ctx = self.turn_context_for(&session)?;
        self.spawn_locked_turn(manager, session_id.to_string(), ctx, content);
        Ok(subscription)
    }

    pub(crate) fn require_session(&self, session_id: &str) -> Result<Session> {
        self.sessions.get(session_id).ok_or_else(|| Error::NotFound(format!("session '{session_id}' not found")))
    }

    /// Append a user message to a session's transcript without driving a
    /// turn — spec.md §4.9's "append user message (persist only)".
    pub fn append_user_message(&self, session_id: &str, content: String) -> Result<()> {
        self.require_session(session_id)?;
        self.transcripts.append(session_id, ad_domain::message::Message::user(content))?;
        self.sessions.record_message(session_id)?;
        Ok(())
    }

    /// Fires one automation: creates a transient session under the
    /// automation's project (used as the profile id) and runs one turn
    /// synchronously so the caller can record the outcome. Supplied to
    /// [`crate::scheduler::AutomationScheduler`] as its [`crate::scheduler::FireFn`].
    pub async fn fire_automation(self: &Arc<Self>, request: FireRequest) -> std::result::Result<String, String> {
        let session = self.create_session(&request.project_id).map_err(|e| e.to_string())?;
        let manager = self.streams.get_or_create(&session.id);
        let ctx = self.turn_context_for(&session).map_err(|e| e.to_string())?;

        let _ = self.sessions.set_status(&session.id, SessionStatus::Running);
        manager.drive_turn(ctx, request.message).await;
        self.cancel_map.remove(&session.id);
        let _ = self.sessions.set_status(&session.id, SessionStatus::Idle);
        self.daemon_events.publish(
            "automation:fired",
            serde_json::json!({ "automation_id": request.automation_id, "session_id": session.id }),
        );
        Ok(session.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ad_domain::config::LlmConfig;

    fn state(tmp: &std::path::Path) -> Arc<AppState> {
        let config = Arc::new(Config::default());
        let providers = Arc::new(ProviderRegistry::from_config(&LlmConfig::default()).unwrap());
        Arc::new(AppState::new(config, providers, tmp.to_path_buf()).unwrap())
    }

    #[test]
    fn create_session_writes_an_immutable_mount_plan() {
        let tmp = tempfile::tempdir().unwrap();
        let app = state(tmp.path());
        let session = app.create_session("default").unwrap();

        assert!(session.mount_plan_path.exists());
        let plan: MountPlan = serde_json::from_str(&std::fs::read_to_string(&session.mount_plan_path).unwrap()).unwrap();
        assert_eq!(plan.profile_id, "default");
    }

    #[test]
    fn get_transcript_on_fresh_session_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let app = state(tmp.path());
        let session = app.create_session("default").unwrap();
        let lines = app.get_transcript(&session.id).unwrap();
        assert!(lines.is_empty());
    }

    #[test]
    fn append_user_message_persists_without_running_a_turn() {
        let tmp = tempfile::tempdir().unwrap();
        let app = state(tmp.path());
        let session = app.create_session("default").unwrap();

        app.append_user_message(&session.id, "hello".into()).unwrap();

        let lines = app.get_transcript(&session.id).unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(app.sessions.get(&session.id).unwrap().message_count, 1);
        assert_eq!(app.sessions.get(&session.id).unwrap().status, SessionStatus::Created);
    }

    #[tokio::test]
    async fn send_message_on_unknown_session_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let app = state(tmp.path());
        let err = app.send_message("does-not-exist", "hi".into()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn send_message_runs_a_turn_and_updates_session_status() {
        let tmp = tempfile::tempdir().unwrap();
        let app = state(tmp.path());
        let session = app.create_session("default").unwrap();

        let manager = app.streams.get_or_create(&session.id);
        let mut sub = manager.subscribe();

        app.send_message(&session.id, "hello".into()).unwrap();

        let mut saw_done = false;
        for _ in 0..20 {
            if let Some(event) = sub.next().await {
                if event.event == "message" && event.data["type"] == "done" {
                    saw_done = true;
                    break;
                }
            }
        }
        assert!(saw_done);

        let lines = app.get_transcript(&session.id).unwrap();
        assert!(!lines.is_empty());
    }
}
