//! One-shot backend initialization
//!
//! Runs the init command at most once per incarnation and never again once
//! the completion flag exists. Progress is parsed from the command output
//! line by line and published to the shared snapshot.

use crate::backend::{Backend, CommandOutput};
use crate::config::{BackendConfig, InitConfig};
use crate::marker::Marker;
use crate::state::{SharedState, Status};
use crate::tasks::TaskLedger;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Output markers that mean the backend state does not exist yet
const MISSING_STATE_MARKERS: &[&str] = &[
    "no such table",
    "doesn't exist",
    "migration table not found",
];

/// Occurrences of this marker count already-completed tasks
const COMPLETED_MARKER: &str = "ran";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// Completion flag was already present
    AlreadyComplete,
    /// Backend state showed the work was done before; flag written
    ExistingState,
    /// Init command ran and succeeded
    Completed { tasks: u32 },
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("backend did not accept commands within {0:?}")]
    BackendUnavailable(Duration),

    #[error("init command could not be run: {0}")]
    Spawn(String),

    #[error("init command exited with code {0}")]
    Failed(i64),

    #[error("init command did not finish within {0:?}")]
    TimedOut(Duration),
}

impl InitError {
    /// Whether a later monitor iteration may trigger init again
    pub fn is_retryable(&self) -> bool {
        matches!(self, InitError::BackendUnavailable(_))
    }
}

/// Conservative check of the state command output.
///
/// Anything ambiguous counts as not done.
pub fn existing_state_complete(output: &CommandOutput, sanity_threshold: usize) -> bool {
    let lower = output.output.to_lowercase();
    if MISSING_STATE_MARKERS.iter().any(|m| lower.contains(m)) {
        return false;
    }
    output.success && lower.matches(COMPLETED_MARKER).count() > sanity_threshold
}

/// Commands the runner issues against the backend
#[derive(Debug, Clone)]
struct Commands {
    readiness: Vec<String>,
    readiness_output: Option<String>,
    state: Vec<String>,
    init: Vec<String>,
}

pub struct InitRunner<B> {
    backend: Arc<B>,
    state: SharedState,
    flag: Marker,
    commands: Commands,
    config: InitConfig,
}

impl<B: Backend> InitRunner<B> {
    pub fn new(
        backend: Arc<B>,
        state: SharedState,
        flag: Marker,
        backend_config: &BackendConfig,
        config: InitConfig,
    ) -> Self {
        Self {
            backend,
            state,
            flag,
            commands: Commands {
                readiness: backend_config.readiness_command.clone(),
                readiness_output: backend_config.readiness_output.clone(),
                state: backend_config.state_command.clone(),
                init: backend_config.init_command.clone(),
            },
            config,
        }
    }

    /// Run initialization if it has not completed before
    pub async fn run(&self) -> Result<InitOutcome, InitError> {
        if self.flag.exists().await {
            debug!(flag = %self.flag.path().display(), "Initialization already complete");
            return Ok(InitOutcome::AlreadyComplete);
        }

        let task_timeout = self.config.task_timeout();
        let result = match tokio::time::timeout(task_timeout, self.run_steps()).await {
            Ok(result) => result,
            Err(_) => Err(InitError::TimedOut(task_timeout)),
        };

        match &result {
            Ok(outcome) => info!(?outcome, "Initialization finished"),
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Initialization deferred");
                self.state
                    .update(|s| s.detail = "Backend not accepting commands yet".to_string());
            }
            Err(e) => {
                error!(error = %e, "Initialization failed");
                let detail: String = e.to_string().chars().take(50).collect();
                self.state.update(|s| {
                    s.message = "Initialization error".to_string();
                    s.detail = detail;
                });
            }
        }

        result
    }

    async fn run_steps(&self) -> Result<InitOutcome, InitError> {
        self.wait_for_backend().await?;

        if self.has_existing_state().await {
            info!("Backend state already present, skipping init command");
            self.write_flag().await;
            return Ok(InitOutcome::ExistingState);
        }

        let tasks = self.stream_init().await?;
        self.write_flag().await;
        self.state.update(|s| {
            s.status = Status::Optimization;
            s.message = "Migrations complete".to_string();
            s.detail = format!("{} tasks completed", tasks);
            s.progress = 92;
            s.migrations_done = tasks;
            s.current_task = None;
        });
        Ok(InitOutcome::Completed { tasks })
    }

    /// Poll until the backend is live and accepts commands
    async fn wait_for_backend(&self) -> Result<(), InitError> {
        let timeout = self.config.wait_timeout();
        let start = Instant::now();

        loop {
            if self.accepts_commands().await {
                debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Backend accepts commands");
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(InitError::BackendUnavailable(timeout));
            }
            tokio::time::sleep(self.config.wait_interval()).await;
        }
    }

    async fn accepts_commands(&self) -> bool {
        let call_timeout = self.config.state_check_timeout();

        match tokio::time::timeout(call_timeout, self.backend.is_live()).await {
            Ok(Ok(true)) => {}
            _ => return false,
        }

        if self.commands.readiness.is_empty() {
            return true;
        }

        match tokio::time::timeout(call_timeout, self.backend.exec(&self.commands.readiness)).await
        {
            Ok(Ok(out)) => match self.commands.readiness_output {
                Some(ref expected) => out.output.contains(expected.as_str()),
                None => out.success,
            },
            Ok(Err(e)) => {
                debug!(error = %e, "Readiness command failed");
                false
            }
            Err(_) => false,
        }
    }

    async fn has_existing_state(&self) -> bool {
        let call_timeout = self.config.state_check_timeout();
        match tokio::time::timeout(call_timeout, self.backend.exec(&self.commands.state)).await {
            Ok(Ok(output)) => {
                let done = existing_state_complete(&output, self.config.sanity_threshold);
                debug!(success = output.success, done, "Existing state check");
                done
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Existing state check failed");
                false
            }
            Err(_) => {
                warn!(timeout_secs = call_timeout.as_secs(), "Existing state check timed out");
                false
            }
        }
    }

    async fn write_flag(&self) {
        if let Err(e) = self.flag.create().await {
            error!(
                flag = %self.flag.path().display(),
                error = %e,
                "Failed to write completion flag"
            );
        }
    }

    /// Run the init command, publishing progress per output line.
    /// Returns the number of distinct completed tasks.
    async fn stream_init(&self) -> Result<u32, InitError> {
        let mut ledger = TaskLedger::new(self.config.total_estimate);
        let total = ledger.total();
        self.state.update(|s| {
            s.status = Status::Migrating;
            s.message = "Creating tables...".to_string();
            s.detail = "Starting migrations".to_string();
            s.progress = 5;
            s.migrations_total = total;
        });
        info!(command = ?self.commands.init, "Starting init command");

        let (tx, mut rx) = mpsc::channel::<String>(256);
        let exec = self.backend.exec_streaming(&self.commands.init, tx);
        tokio::pin!(exec);

        let line_timeout = self.config.line_timeout();
        let mut exit = None;
        loop {
            tokio::select! {
                result = &mut exec, if exit.is_none() => {
                    exit = Some(result);
                }
                line = tokio::time::timeout(line_timeout, rx.recv()) => match line {
                    Ok(Some(line)) => self.observe_line(&mut ledger, &line),
                    Ok(None) => break,
                    Err(_) => warn!(
                        idle_secs = line_timeout.as_secs(),
                        "Init command produced no output"
                    ),
                }
            }
        }

        let exit = match exit {
            Some(result) => result,
            None => exec.await,
        };

        match exit {
            Ok(0) => Ok(ledger.done()),
            Ok(code) => Err(InitError::Failed(code)),
            Err(e) => Err(InitError::Spawn(e.to_string())),
        }
    }

    fn observe_line(&self, ledger: &mut TaskLedger, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        info!(target: "init_task", "{}", line);

        if let Some(record) = ledger.observe_line(line) {
            let name = record.name.clone();
            let done = ledger.done();
            let total = ledger.total();
            let progress = ledger.progress();
            let names = ledger.names();
            self.state.update(|s| {
                s.status = Status::Migrating;
                s.migrations_done = done;
                s.migrations_total = total;
                s.current_task = Some(name);
                s.completed_tasks = names;
                s.progress = progress;
                s.message = "Creating tables...".to_string();
                s.detail = format!("Task {}/{}", done, total);
            });
            return;
        }

        let lower = line.to_lowercase();
        if lower.contains("running migrations") {
            self.state.update(|s| {
                s.message = "Running migrations...".to_string();
                s.detail = "Starting".to_string();
                s.progress = 8;
            });
        } else if lower.contains("nothing to migrate") {
            self.state.update(|s| {
                s.message = "Database up to date".to_string();
                s.progress = 90;
            });
        }
    }
}
