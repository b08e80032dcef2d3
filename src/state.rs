//! Shared readiness snapshot
//!
//! One owned state object guarded by a single lock. Readers take a
//! point-in-time copy, writers go through [`SharedState::update`] which
//! enforces the progress invariants after every mutation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// Coarse readiness status reported to clients
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Starting,
    Waiting,
    Migrating,
    Optimization,
    MigrationsDone,
    Initializing,
    Ready,
}

/// Point-in-time readiness record
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Snapshot {
    pub status: Status,
    pub message: String,
    pub detail: String,
    pub progress: u8,
    pub migrations_done: u32,
    pub migrations_total: u32,
    pub current_task: Option<String>,
    pub completed_tasks: Vec<String>,
    pub panel_ready: bool,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub started_at: DateTime<Utc>,
}

impl Snapshot {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            status: Status::Starting,
            message: "Starting up...".to_string(),
            detail: String::new(),
            progress: 0,
            migrations_done: 0,
            migrations_total: 0,
            current_task: None,
            completed_tasks: Vec::new(),
            panel_ready: false,
            started_at,
        }
    }

    /// Seconds since the front door started
    pub fn elapsed_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds().max(0)
    }
}

/// Body of the status API: the snapshot plus its derived age
#[derive(Debug, Serialize)]
pub struct StatusReport {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub elapsed_seconds: i64,
}

impl From<Snapshot> for StatusReport {
    fn from(snapshot: Snapshot) -> Self {
        let elapsed_seconds = snapshot.elapsed_seconds();
        Self {
            snapshot,
            elapsed_seconds,
        }
    }
}

#[derive(Debug)]
struct Inner {
    snapshot: Snapshot,
    init_triggered: bool,
    init_running: bool,
}

/// Handle to the shared snapshot, cheap to clone
#[derive(Debug, Clone)]
pub struct SharedState {
    inner: Arc<Mutex<Inner>>,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                snapshot: Snapshot::new(Utc::now()),
                init_triggered: false,
                init_running: false,
            })),
        }
    }

    /// Copy of the current snapshot; the lock is released on return
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().snapshot.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().snapshot.panel_ready
    }

    /// Apply a mutation, then restore the invariants:
    /// progress never decreases before ready, ready pins progress at 100,
    /// and a ready snapshot never leaves the ready state.
    pub fn update<F>(&self, f: F) -> Snapshot
    where
        F: FnOnce(&mut Snapshot),
    {
        let mut inner = self.inner.lock();
        let previous_progress = inner.snapshot.progress;
        let was_ready = inner.snapshot.panel_ready;

        f(&mut inner.snapshot);

        let snapshot = &mut inner.snapshot;
        if was_ready {
            snapshot.panel_ready = true;
        }
        if snapshot.panel_ready {
            snapshot.status = Status::Ready;
        }
        if snapshot.status == Status::Ready {
            snapshot.progress = 100;
            snapshot.current_task = None;
        } else {
            snapshot.progress = snapshot.progress.clamp(previous_progress, 100);
        }

        snapshot.clone()
    }

    /// Atomically claim the one-shot init slot.
    ///
    /// Returns `None` when init was already triggered in this process or a
    /// run is in flight. The returned guard clears the running flag on drop.
    pub fn try_begin_init(&self) -> Option<InitGuard> {
        let mut inner = self.inner.lock();
        if inner.init_triggered || inner.init_running {
            return None;
        }
        inner.init_triggered = true;
        inner.init_running = true;
        Some(InitGuard {
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn is_init_running(&self) -> bool {
        self.inner.lock().init_running
    }

    pub fn init_triggered(&self) -> bool {
        self.inner.lock().init_triggered
    }
}

/// Proof that the holder owns the in-flight init run
#[derive(Debug)]
pub struct InitGuard {
    inner: Arc<Mutex<Inner>>,
}

impl InitGuard {
    /// Release the slot and allow a later monitor iteration to trigger init again
    pub fn allow_retry(self) {
        self.inner.lock().init_triggered = false;
    }
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        self.inner.lock().init_running = false;
    }
}
