//! Automation Scheduler (C7) — fires automations on their trigger and
//! records the outcome.
//!
//! The scheduler holds an in-memory map of automation id → next fire time,
//! kept in sync with [`AutomationStore`] via `schedule`/`unschedule`. A
//! background tick task checks the map against the clock; firing is
//! decoupled from session machinery through [`FireFn`] so this module has
//! no dependency on [`crate::state`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use super::model::{Automation, ExecutionRecord, ExecutionStatus};
use super::store::AutomationStore;

/// What the scheduler asks the caller to do when an automation fires.
pub struct FireRequest {
    pub automation_id: String,
    pub project_id: String,
    pub message: String,
}

/// Starts a transient session for a firing automation and runs one turn,
/// returning the session id on success. Supplied by `state.rs`, which has
/// the coordinator/mount-plan machinery this module deliberately avoids.
pub type FireFn = Arc<dyn Fn(FireRequest) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

const TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Bound on how long `stop()` waits for in-flight firings to finish.
const STOP_GRACE: Duration = Duration::from_secs(30);

pub struct AutomationScheduler {
    store: Arc<AutomationStore>,
    fire: FireFn,
    registered: Mutex<HashMap<String, chrono::DateTime<Utc>>>,
    running: AtomicBool,
    shutdown: Arc<Notify>,
    in_flight: Arc<std::sync::atomic::AtomicUsize>,
    drained: Arc<Notify>,
}

impl AutomationScheduler {
    pub fn new(store: Arc<AutomationStore>, fire: FireFn) -> Self {
        Self {
            store,
            fire,
            registered: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            in_flight: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            drained: Arc::new(Notify::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Load every enabled automation and register it. Idempotent — calling
    /// `start()` while already running is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        for automation in self.store.list(None) {
            if automation.enabled {
                self.schedule(&automation);
            }
        }

        let scheduler = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(TICK_INTERVAL) => scheduler.tick().await,
                    _ = scheduler.shutdown.notified() => break,
                }
            }
        });
    }

    /// Cancel all pending fires and wait (best effort, bounded) for
    /// in-flight firings to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shutdown.notify_one();
        self.registered.lock().clear();

        if self.in_flight.load(Ordering::Acquire) > 0 {
            let _ = tokio::time::timeout(STOP_GRACE, self.drained.notified()).await;
        }
    }

    /// (Re)register an automation keyed by its id — an update replaces the
    /// existing registration, it never duplicates. Disabled automations are
    /// unregistered instead.
    pub fn schedule(&self, automation: &Automation) {
        if !automation.enabled {
            self.unschedule(&automation.id);
            return;
        }
        let now = Utc::now();
        match super::model::next_fire_after(&automation.schedule, now, automation.last_execution) {
            Some(next) => {
                self.registered.lock().insert(automation.id.clone(), next);
                let _ = self.store.update(&automation.id, |a| a.next_execution = Some(next));
            }
            None => self.unschedule(&automation.id),
        }
    }

    pub fn unschedule(&self, id: &str) {
        self.registered.lock().remove(id);
        let _ = self.store.update(id, |a| a.next_execution = None);
    }

    async fn tick(&self) {
        let now = Utc::now();
        let due: Vec<String> = {
            let registered = self.registered.lock();
            registered.iter().filter(|(_, next)| **next <= now).map(|(id, _)| id.clone()).collect()
        };
        for id in due {
            self.fire_one(&id).await;
        }
    }

    async fn fire_one(&self, id: &str) {
        let Some(automation) = self.store.get(id) else {
            self.unschedule(id);
            return;
        };
        self.in_flight.fetch_add(1, Ordering::AcqRel);

        let request = FireRequest {
            automation_id: automation.id.clone(),
            project_id: automation.project_id.clone(),
            message: automation.message.clone(),
        };
        let outcome = (self.fire)(request).await;
        let now = Utc::now();

        let record = match &outcome {
            Ok(session_id) => ExecutionRecord {
                id: Uuid::new_v4().to_string(),
                automation_id: automation.id.clone(),
                session_id: Some(session_id.clone()),
                executed_at: now,
                status: ExecutionStatus::Success,
                error: None,
            },
            Err(message) => ExecutionRecord {
                id: Uuid::new_v4().to_string(),
                automation_id: automation.id.clone(),
                session_id: None,
                executed_at: now,
                status: ExecutionStatus::Failed,
                error: Some(message.clone()),
            },
        };
        if let Err(e) = self.store.record_execution(&record) {
            tracing::warn!(automation_id = %automation.id, error = %e, "failed to record automation execution");
        }
        let _ = self.store.update(&automation.id, |a| a.last_execution = Some(now));

        if let Some(refreshed) = self.store.get(&automation.id) {
            self.schedule(&refreshed);
        }

        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}
