//! Backend collaborator interface
//!
//! The front door never manages the backend's lifecycle. It only asks
//! whether it is live, reads its logs and runs commands against it.

use crate::config::{BackendConfig, BackendType};
use crate::docker::DockerBackend;
use crate::process::LocalBackend;
use std::future::Future;
use tokio::sync::mpsc;

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// Combined stdout and stderr
    pub output: String,
}

pub trait Backend: Send + Sync + 'static {
    /// Whether the backend process or container is up
    fn is_live(&self) -> impl Future<Output = anyhow::Result<bool>> + Send;

    /// Last `tail` lines of backend log output
    fn fetch_logs(&self, tail: usize) -> impl Future<Output = anyhow::Result<String>> + Send;

    /// Run a command to completion and capture its output
    fn exec(&self, command: &[String])
        -> impl Future<Output = anyhow::Result<CommandOutput>> + Send;

    /// Run a command, sending each output line as soon as it is read.
    /// Returns the exit code.
    fn exec_streaming(
        &self,
        command: &[String],
        lines: mpsc::Sender<String>,
    ) -> impl Future<Output = anyhow::Result<i64>> + Send;
}

/// Backend selected by configuration
pub enum AnyBackend {
    Local(LocalBackend),
    Docker(DockerBackend),
}

impl AnyBackend {
    pub async fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        match config.backend_type {
            BackendType::Local => Ok(AnyBackend::Local(LocalBackend::from_config(config))),
            BackendType::Docker => Ok(AnyBackend::Docker(
                DockerBackend::from_config(config).await?,
            )),
        }
    }
}

impl Backend for AnyBackend {
    async fn is_live(&self) -> anyhow::Result<bool> {
        match self {
            AnyBackend::Local(b) => b.is_live().await,
            AnyBackend::Docker(b) => b.is_live().await,
        }
    }

    async fn fetch_logs(&self, tail: usize) -> anyhow::Result<String> {
        match self {
            AnyBackend::Local(b) => b.fetch_logs(tail).await,
            AnyBackend::Docker(b) => b.fetch_logs(tail).await,
        }
    }

    async fn exec(&self, command: &[String]) -> anyhow::Result<CommandOutput> {
        match self {
            AnyBackend::Local(b) => b.exec(command).await,
            AnyBackend::Docker(b) => b.exec(command).await,
        }
    }

    async fn exec_streaming(
        &self,
        command: &[String],
        lines: mpsc::Sender<String>,
    ) -> anyhow::Result<i64> {
        match self {
            AnyBackend::Local(b) => b.exec_streaming(command, lines).await,
            AnyBackend::Docker(b) => b.exec_streaming(command, lines).await,
        }
    }
}

/// Splits a chunked byte stream into complete lines
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    /// Append a chunk and drain every complete line
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }

    /// Flush the trailing partial line, if any
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// Keep only the last `tail` lines of `text`
pub(crate) fn tail_lines(text: &str, tail: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(tail);
    lines[start..].join("\n")
}
