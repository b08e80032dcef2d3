//! Readiness monitor
//!
//! Periodically merges backend liveness, the published status document,
//! classified backend logs and the readiness probe into the shared
//! snapshot. Triggers the one-shot init runner once the backend is live.

use crate::backend::Backend;
use crate::classifier::{classify, Classification, Phase};
use crate::config::MonitorConfig;
use crate::health::ReadinessProbe;
use crate::init::InitRunner;
use crate::state::{SharedState, Snapshot, Status};
use crate::status_source::{StatusDocument, StatusSource};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub struct ReadinessMonitor<B, P> {
    backend: Arc<B>,
    probe: P,
    state: SharedState,
    init: Arc<InitRunner<B>>,
    status_source: StatusSource,
    config: MonitorConfig,
    consecutive_ready: u32,
}

fn status_for(phase: Phase) -> Status {
    match phase {
        Phase::Startup => Status::Starting,
        Phase::Migrations => Status::Migrating,
        Phase::MigrationsDone => Status::MigrationsDone,
        Phase::Optimization => Status::Optimization,
        // Only the probe may declare the backend ready
        Phase::Ready => Status::Initializing,
    }
}

impl<B: Backend, P: ReadinessProbe> ReadinessMonitor<B, P> {
    pub fn new(
        backend: Arc<B>,
        probe: P,
        state: SharedState,
        init: Arc<InitRunner<B>>,
        status_source: StatusSource,
        config: MonitorConfig,
    ) -> Self {
        Self {
            backend,
            probe,
            state,
            init,
            status_source,
            config,
            consecutive_ready: 0,
        }
    }

    /// Run until the shutdown flag is set
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.interval_ms,
            ready_threshold = self.config.ready_threshold,
            "Readiness monitor started"
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.tick().await;

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval()) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Readiness monitor stopped");
    }

    /// One monitor iteration. Returns the resulting snapshot.
    pub async fn tick(&mut self) -> Snapshot {
        if self.state.is_ready() {
            return self.state.snapshot();
        }

        let live = match tokio::time::timeout(
            self.config.liveness_timeout(),
            self.backend.is_live(),
        )
        .await
        {
            Ok(Ok(live)) => live,
            Ok(Err(e)) => {
                warn!(error = %e, "Liveness check failed");
                return self.state.snapshot();
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.liveness_timeout_secs,
                    "Liveness check timed out"
                );
                return self.state.snapshot();
            }
        };

        if !live {
            self.consecutive_ready = 0;
            return self.state.update(|s| {
                s.status = Status::Waiting;
                s.message = "Waiting for backend...".to_string();
                s.detail = "The backend is not running yet".to_string();
                s.current_task = None;
                s.completed_tasks.clear();
            });
        }

        self.maybe_start_init();

        if self.state.is_init_running() {
            // The init runner owns the snapshot fields while it runs
            return self.state.snapshot();
        }

        match self.status_source.read().await {
            Some(doc) => self.apply_document(&doc),
            None => self.apply_logs().await,
        }

        self.apply_probe().await
    }

    fn maybe_start_init(&self) {
        let Some(guard) = self.state.try_begin_init() else {
            return;
        };

        info!("Backend is live, starting initialization");
        let runner = Arc::clone(&self.init);
        tokio::spawn(async move {
            match runner.run().await {
                Err(e) if e.is_retryable() => guard.allow_retry(),
                _ => drop(guard),
            }
        });
    }

    fn apply_document(&self, doc: &StatusDocument) {
        debug!(progress = doc.progress, "Using published status document");
        self.state.update(|s| {
            s.progress = doc.progress_percent();
            s.message = doc
                .message
                .clone()
                .unwrap_or_else(|| "Initializing...".to_string());
            s.migrations_done = doc.migrations_done;
            s.migrations_total = doc.migrations_total;
            s.current_task = doc.current_task.clone();
            if !doc.completed_tasks.is_empty() {
                s.completed_tasks = doc.completed_tasks.clone();
            }
            if s.current_task.is_some() {
                s.status = Status::Migrating;
                s.detail = format!("Task {}/{}", s.migrations_done, s.migrations_total);
            } else {
                s.detail = s.message.clone();
            }
        });
    }

    async fn apply_logs(&self) {
        let logs = match tokio::time::timeout(
            self.config.log_timeout(),
            self.backend.fetch_logs(self.config.log_tail),
        )
        .await
        {
            Ok(Ok(logs)) => logs,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to fetch backend logs");
                return;
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.config.log_timeout_secs,
                    "Fetching backend logs timed out"
                );
                return;
            }
        };

        let classification = classify(&logs);
        debug!(phase = ?classification.phase, "Classified backend logs");
        self.apply_classification(classification);
    }

    fn apply_classification(&self, c: Classification) {
        self.state.update(|s| {
            s.status = status_for(c.phase);
            match c.phase {
                Phase::Optimization => {
                    s.progress = c.progress.unwrap_or(90);
                    s.detail = "Preparing the application...".to_string();
                }
                Phase::Ready => {
                    s.progress = c.progress.unwrap_or(98);
                    s.detail = "Final checks...".to_string();
                }
                _ => {
                    s.progress = c.progress.unwrap_or(5);
                    s.detail = "Initialization in progress".to_string();
                }
            }
            let fallback = match c.phase {
                Phase::Migrations => "Running migrations...",
                _ => "Starting...",
            };
            s.message = c.message.unwrap_or(fallback).to_string();
            s.current_task = None;
        });
    }

    async fn apply_probe(&mut self) -> Snapshot {
        if self.probe.check().await {
            self.consecutive_ready += 1;
            debug!(consecutive = self.consecutive_ready, "Readiness probe passed");

            if self.consecutive_ready >= self.config.ready_threshold {
                info!("Backend confirmed ready");
                return self.state.update(|s| {
                    s.panel_ready = true;
                    s.status = Status::Ready;
                    s.message = "Ready!".to_string();
                    s.detail = "Redirecting...".to_string();
                    s.progress = 100;
                    s.current_task = None;
                });
            }
            self.state.snapshot()
        } else {
            self.consecutive_ready = 0;
            self.state.update(|s| s.status = Status::Initializing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CommandOutput;
    use crate::config::{BackendConfig, InitConfig};
    use crate::marker::Marker;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct FakeBackend {
        down: Mutex<bool>,
        logs: Mutex<String>,
    }

    impl Backend for FakeBackend {
        async fn is_live(&self) -> anyhow::Result<bool> {
            Ok(!*self.down.lock())
        }

        async fn fetch_logs(&self, _tail: usize) -> anyhow::Result<String> {
            Ok(self.logs.lock().clone())
        }

        async fn exec(&self, _command: &[String]) -> anyhow::Result<CommandOutput> {
            Ok(CommandOutput {
                success: false,
                output: String::new(),
            })
        }

        async fn exec_streaming(
            &self,
            _command: &[String],
            _lines: mpsc::Sender<String>,
        ) -> anyhow::Result<i64> {
            Ok(1)
        }
    }

    struct ScriptedProbe {
        results: Mutex<VecDeque<bool>>,
    }

    impl ScriptedProbe {
        fn new(results: &[bool]) -> Self {
            Self {
                results: Mutex::new(results.iter().copied().collect()),
            }
        }
    }

    impl ReadinessProbe for ScriptedProbe {
        async fn check(&self) -> bool {
            self.results.lock().pop_front().unwrap_or(false)
        }
    }

    struct Harness {
        monitor: ReadinessMonitor<FakeBackend, ScriptedProbe>,
        backend: Arc<FakeBackend>,
        state: SharedState,
        dir: tempfile::TempDir,
    }

    fn harness(probe_results: &[bool]) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        let state = SharedState::new();
        // Claim the one-shot slot so ticks never spawn the runner
        drop(state.try_begin_init());

        let init = Arc::new(InitRunner::new(
            Arc::clone(&backend),
            state.clone(),
            Marker::new(dir.path().join("init_complete")),
            &BackendConfig::default(),
            InitConfig::default(),
        ));
        let monitor = ReadinessMonitor::new(
            Arc::clone(&backend),
            ScriptedProbe::new(probe_results),
            state.clone(),
            init,
            StatusSource::new(dir.path().join("init_status.json"), Duration::from_secs(60)),
            MonitorConfig::default(),
        );

        Harness {
            monitor,
            backend,
            state,
            dir,
        }
    }

    #[tokio::test]
    async fn test_consecutive_confirmation() {
        let mut h = harness(&[true, true, false, true, true, true]);
        let mut ready = Vec::new();
        for _ in 0..6 {
            ready.push(h.monitor.tick().await.panel_ready);
        }
        assert_eq!(ready, vec![false, false, false, false, false, true]);

        let snap = h.state.snapshot();
        assert_eq!(snap.status, Status::Ready);
        assert_eq!(snap.progress, 100);
    }

    #[tokio::test]
    async fn test_probe_failure_sets_initializing() {
        let mut h = harness(&[false]);
        *h.backend.logs.lock() = "Migrating database".to_string();
        let snap = h.monitor.tick().await;
        assert_eq!(snap.status, Status::Initializing);
        assert_eq!(snap.progress, 10);
    }

    #[tokio::test]
    async fn test_classifier_progress_is_monotonic() {
        let mut h = harness(&[]);
        let sequence = [
            "Generating key",
            "Migrating database",
            "External vars",
            "Nothing to migrate",
            "Preparing database",
            "Optimizing Filament",
            "",
        ];

        let mut last = 0;
        for logs in sequence {
            *h.backend.logs.lock() = logs.to_string();
            let snap = h.monitor.tick().await;
            assert!(snap.progress >= last, "{} < {}", snap.progress, last);
            last = snap.progress;
        }
        assert_eq!(last, 92);
    }

    #[tokio::test]
    async fn test_not_live_sets_waiting() {
        let mut h = harness(&[true, true, true]);
        h.state.update(|s| {
            s.progress = 40;
            s.completed_tasks = vec!["create_users_table".to_string()];
            s.current_task = Some("create_users_table".to_string());
        });
        h.monitor.tick().await;
        h.monitor.tick().await;

        *h.backend.down.lock() = true;
        let snap = h.monitor.tick().await;
        assert_eq!(snap.status, Status::Waiting);
        assert!(snap.completed_tasks.is_empty());
        assert!(snap.current_task.is_none());
        assert_eq!(snap.progress, 40);

        // The confirmation counter restarted
        *h.backend.down.lock() = false;
        assert!(!h.monitor.tick().await.panel_ready);
    }

    #[tokio::test]
    async fn test_status_document_preferred_over_logs() {
        let mut h = harness(&[]);
        *h.backend.logs.lock() = "Optimizing Filament".to_string();
        std::fs::write(
            h.dir.path().join("init_status.json"),
            r#"{"progress": 37, "message": "Creating tables...", "migrations_done": 12,
                "migrations_total": 222, "current_migration": "create_nodes_table",
                "completed_migrations": ["a", "b"]}"#,
        )
        .unwrap();

        h.monitor.tick().await;
        let snap = h.state.snapshot();
        assert_eq!(snap.progress, 37);
        assert_eq!(snap.migrations_done, 12);
        assert_eq!(snap.detail, "Task 12/222");
        assert_eq!(snap.completed_tasks, vec!["a", "b"]);
        assert_eq!(snap.current_task.as_deref(), Some("create_nodes_table"));
    }

    #[tokio::test]
    async fn test_stale_document_falls_back_to_logs() {
        let mut h = harness(&[]);
        *h.backend.logs.lock() = "Nothing to migrate".to_string();
        std::fs::write(
            h.dir.path().join("init_status.json"),
            r#"{"progress": 60, "timestamp": 1000}"#,
        )
        .unwrap();

        let snap = h.monitor.tick().await;
        assert_eq!(snap.progress, 85);
    }

    #[tokio::test]
    async fn test_init_running_leaves_snapshot_alone() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FakeBackend::default());
        *backend.logs.lock() = "Optimizing Filament".to_string();
        let state = SharedState::new();
        let _guard = state.try_begin_init().unwrap();
        state.update(|s| {
            s.status = Status::Migrating;
            s.progress = 30;
        });

        let init = Arc::new(InitRunner::new(
            Arc::clone(&backend),
            state.clone(),
            Marker::new(dir.path().join("init_complete")),
            &BackendConfig::default(),
            InitConfig::default(),
        ));
        let mut monitor = ReadinessMonitor::new(
            backend,
            ScriptedProbe::new(&[true, true, true]),
            state.clone(),
            init,
            StatusSource::new(dir.path().join("init_status.json"), Duration::from_secs(60)),
            MonitorConfig::default(),
        );

        for _ in 0..3 {
            let snap = monitor.tick().await;
            assert_eq!(snap.status, Status::Migrating);
            assert_eq!(snap.progress, 30);
            assert!(!snap.panel_ready);
        }
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let h = harness(&[]);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.monitor.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("monitor stops")
            .unwrap();
    }

    #[test]
    fn test_ready_phase_does_not_mean_ready_status() {
        assert_eq!(status_for(Phase::Ready), Status::Initializing);
        assert_eq!(status_for(Phase::MigrationsDone), Status::MigrationsDone);
        assert_eq!(status_for(Phase::Startup), Status::Starting);
    }
}
