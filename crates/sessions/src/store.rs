//! Session store.
//!
//! Persists session metadata as one `metadata.json` per session under
//! `sessions/<id>/`, atomically rewritten on every update. A session is
//! created from an immutable mount plan and lives until explicitly closed
//! or the process exits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ad_domain::error::{Error, Result};

/// Lifecycle status of a session, per the daemon's session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    Idle,
    Completed,
    Failed,
}

/// A single session tracked by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub profile_id: String,
    pub status: SessionStatus,
    pub mount_plan_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub message_count: u64,
}

/// In-memory session registry backed by per-session `metadata.json` files.
pub struct SessionStore {
    sessions_dir: PathBuf,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionStore {
    /// Load every persisted session under `state_path/sessions/`.
    pub fn new(state_path: &Path) -> Result<Self> {
        let sessions_dir = state_path.join("sessions");
        std::fs::create_dir_all(&sessions_dir).map_err(Error::Io)?;

        let mut sessions = HashMap::new();
        if let Ok(entries) = std::fs::read_dir(&sessions_dir) {
            for entry in entries.flatten() {
                let metadata_path = entry.path().join("metadata.json");
                if !metadata_path.exists() {
                    continue;
                }
                let raw = match std::fs::read_to_string(&metadata_path) {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(path = %metadata_path.display(), error = %e, "skipping unreadable session metadata");
                        continue;
                    }
                };
                match serde_json::from_str::<Session>(&raw) {
                    Ok(session) => {
                        sessions.insert(session.id.clone(), session);
                    }
                    Err(e) => {
                        tracing::warn!(path = %metadata_path.display(), error = %e, "skipping malformed session metadata");
                    }
                }
            }
        }

        tracing::info!(sessions = sessions.len(), path = %sessions_dir.display(), "session store loaded");

        Ok(Self { sessions_dir, sessions: RwLock::new(sessions) })
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.sessions.read().get(session_id).cloned()
    }

    pub fn list(&self) -> Vec<Session> {
        self.sessions.read().values().cloned().collect()
    }

    /// Create a new session bound to an immutable mount plan path, persist
    /// its metadata, and register it in memory.
    pub fn create(&self, id: String, profile_id: String, mount_plan_path: PathBuf) -> Result<Session> {
        let now = Utc::now();
        let session = Session {
            id: id.clone(),
            profile_id,
            status: SessionStatus::Created,
            mount_plan_path,
            created_at: now,
            updated_at: now,
            message_count: 0,
        };

        self.persist(&session)?;
        self.sessions.write().insert(id, session.clone());
        Ok(session)
    }

    /// Transition a session's status, bumping `updated_at`.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<Option<Session>> {
        let updated = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(session_id) {
                Some(entry) => {
                    entry.status = status;
                    entry.updated_at = Utc::now();
                    Some(entry.clone())
                }
                None => None,
            }
        };
        if let Some(ref session) = updated {
            self.persist(session)?;
        }
        Ok(updated)
    }

    /// Record that a message was appended, bumping the counter and `updated_at`.
    pub fn record_message(&self, session_id: &str) -> Result<Option<Session>> {
        let updated = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(session_id) {
                Some(entry) => {
                    entry.message_count += 1;
                    entry.updated_at = Utc::now();
                    Some(entry.clone())
                }
                None => None,
            }
        };
        if let Some(ref session) = updated {
            self.persist(session)?;
        }
        Ok(updated)
    }

    /// Mark sessions idle whose `updated_at` is older than `idle_minutes`
    /// and are currently `Running`. Returns the IDs demoted.
    pub fn demote_idle(&self, idle_minutes: u32) -> Result<Vec<String>> {
        let now = Utc::now();
        let stale: Vec<String> = {
            let sessions = self.sessions.read();
            sessions
                .values()
                .filter(|s| s.status == SessionStatus::Running)
                .filter(|s| now.signed_duration_since(s.updated_at).num_minutes() >= idle_minutes as i64)
                .map(|s| s.id.clone())
                .collect()
        };
        for id in &stale {
            self.set_status(id, SessionStatus::Idle)?;
        }
        Ok(stale)
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    /// Atomically rewrite `sessions/<id>/metadata.json`: write to a `.tmp`
    /// sibling, then rename over the final path.
    fn persist(&self, session: &Session) -> Result<()> {
        let dir = self.session_dir(&session.id);
        std::fs::create_dir_all(&dir).map_err(Error::Io)?;

        let path = dir.join("metadata.json");
        let tmp_path = dir.join("metadata.json.tmp");
        let json = serde_json::to_string_pretty(session).map_err(Error::Json)?;
        std::fs::write(&tmp_path, json).map_err(Error::Io)?;
        std::fs::rename(&tmp_path, &path).map_err(Error::Io)?;
        Ok(())
    }

    /// Directory under which a session's transcript and mount plan live.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_persists_and_registers_session() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).unwrap();
        let session = store.create("s1".into(), "default".into(), PathBuf::from("sessions/s1/mount_plan.json")).unwrap();
        assert_eq!(session.status, SessionStatus::Created);
        assert!(tmp.path().join("sessions/s1/metadata.json").exists());
        assert!(store.get("s1").is_some());
    }

    #[test]
    fn reload_picks_up_persisted_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::new(tmp.path()).unwrap();
            store.create("s1".into(), "default".into(), PathBuf::from("sessions/s1/mount_plan.json")).unwrap();
        }
        let reloaded = SessionStore::new(tmp.path()).unwrap();
        assert_eq!(reloaded.list().len(), 1);
    }

    #[test]
    fn set_status_bumps_updated_at() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).unwrap();
        let created = store.create("s1".into(), "default".into(), PathBuf::from("p")).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let updated = store.set_status("s1", SessionStatus::Running).unwrap().unwrap();
        assert_eq!(updated.status, SessionStatus::Running);
        assert!(updated.updated_at >= created.updated_at);
    }

    #[test]
    fn demote_idle_only_affects_running_sessions_past_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).unwrap();
        store.create("s1".into(), "default".into(), PathBuf::from("p")).unwrap();
        store.set_status("s1", SessionStatus::Running).unwrap();
        let demoted = store.demote_idle(0).unwrap();
        assert_eq!(demoted, vec!["s1".to_string()]);
        assert_eq!(store.get("s1").unwrap().status, SessionStatus::Idle);
    }

    #[test]
    fn record_message_increments_counter() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::new(tmp.path()).unwrap();
        store.create("s1".into(), "default".into(), PathBuf::from("p")).unwrap();
        store.record_message("s1").unwrap();
        store.record_message("s1").unwrap();
        assert_eq!(store.get("s1").unwrap().message_count, 2);
    }
}
