//! Per-session run lock.
//!
//! spec.md §4.9 requires that `send_message` and `execute_sync` serialize
//! against one another per session — the orchestrator only ever holds one
//! transcript-mutating turn open for a given session. This is that lock:
//! a `Semaphore(1)` per session id, acquired for the duration of a turn.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

struct SessionLock {
    sem: Arc<Semaphore>,
    /// Whether a waiter is already queued behind the running turn. At
    /// most one waiter is allowed — a session's lock is a queue depth
    /// of 1, not an unbounded backlog.
    waiting: Arc<AtomicBool>,
}

/// Manages per-session run locks.
///
/// Each session id maps to a `Semaphore(1)`. Acquiring the permit
/// ensures exclusive access for one turn at a time.
pub struct SessionLockMap {
    locks: Mutex<HashMap<String, SessionLock>>,
}

impl Default for SessionLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLockMap {
    pub fn new() -> Self {
        Self { locks: Mutex::new(HashMap::new()) }
    }

    /// Acquire the run lock for a session.
    ///
    /// Returns `Ok(permit)` once acquired — hold it for the duration of
    /// the turn, it releases on drop. Returns `Err(SessionBusy)` if a
    /// turn is already running *and* another caller is already queued
    /// behind it.
    pub async fn acquire(&self, session_id: &str) -> Result<OwnedSemaphorePermit, SessionBusy> {
        let (sem, waiting) = {
            let mut locks = self.locks.lock();
            let lock = locks
                .entry(session_id.to_owned())
                .or_insert_with(|| SessionLock { sem: Arc::new(Semaphore::new(1)), waiting: Arc::new(AtomicBool::new(false)) });
            (lock.sem.clone(), lock.waiting.clone())
        };

        if let Ok(permit) = sem.clone().try_acquire_owned() {
            return Ok(permit);
        }

        if waiting.swap(true, Ordering::AcqRel) {
            return Err(SessionBusy);
        }
        let result = sem.acquire_owned().await.map_err(|_| SessionBusy);
        waiting.store(false, Ordering::Release);
        result
    }

    /// Number of sessions with a tracked lock, running or idle.
    pub fn session_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Number of sessions with a turn actually holding the lock right now.
    pub fn running_count(&self) -> usize {
        self.locks.lock().values().filter(|l| l.sem.available_permits() == 0).count()
    }

    /// Drop locks for sessions with no turn running (periodic cleanup —
    /// a long-lived daemon would otherwise accumulate one entry per
    /// session ever created).
    pub fn prune_idle(&self) {
        let mut locks = self.locks.lock();
        locks.retain(|_, l| l.sem.available_permits() == 0);
    }
}

/// Error returned when a session is busy (turn already in progress + queued).
#[derive(Debug)]
pub struct SessionBusy;

impl std::fmt::Display for SessionBusy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session is busy — a turn is already in progress")
    }
}

impl std::error::Error for SessionBusy {}
