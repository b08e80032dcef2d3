//! Local backend: commands run on this host

use crate::backend::{tail_lines, Backend, CommandOutput};
use crate::config::BackendConfig;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::io::SeekFrom;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::debug;

/// Upper bound on the bytes read from the end of the log file per fetch
const LOG_READ_LIMIT: u64 = 256 * 1024;

/// Backend whose commands are spawned with `tokio::process`
#[derive(Debug, Clone, Default)]
pub struct LocalBackend {
    working_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
    liveness_command: Vec<String>,
}

impl LocalBackend {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            working_dir: config.working_dir.as_ref().map(PathBuf::from),
            log_file: config.log_file.as_ref().map(PathBuf::from),
            liveness_command: config.liveness_command.clone(),
        }
    }

    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn with_liveness_command(mut self, command: Vec<String>) -> Self {
        self.liveness_command = command;
        self
    }

    fn command(&self, command: &[String]) -> anyhow::Result<Command> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| anyhow::anyhow!("Empty command"))?;

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(ref working_dir) = self.working_dir {
            cmd.current_dir(working_dir);
        }

        Ok(cmd)
    }
}

/// Forward every line of `reader` to `tx`, lossily decoded, and drain the
/// pipe to EOF even after the receiver is gone.
async fn forward_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut receiver_open = true;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !receiver_open {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).await.is_err() {
                    receiver_open = false;
                }
            }
            Err(e) => {
                debug!(error = %e, "Command output read failed");
                break;
            }
        }
    }
}

/// Read at most the last `limit` bytes of a file, dropping a leading partial line
async fn read_file_tail(path: &Path, limit: u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let offset = len.saturating_sub(limit);
    file.seek(SeekFrom::Start(offset)).await?;

    let mut bytes = Vec::with_capacity((len - offset) as usize);
    file.read_to_end(&mut bytes).await?;

    let text = String::from_utf8_lossy(&bytes);
    if offset > 0 {
        if let Some(pos) = text.find('\n') {
            return Ok(text[pos + 1..].to_string());
        }
    }
    Ok(text.into_owned())
}

impl Backend for LocalBackend {
    async fn is_live(&self) -> anyhow::Result<bool> {
        if self.liveness_command.is_empty() {
            return Ok(true);
        }
        Ok(self.exec(&self.liveness_command).await?.success)
    }

    async fn fetch_logs(&self, tail: usize) -> anyhow::Result<String> {
        let Some(ref path) = self.log_file else {
            return Ok(String::new());
        };
        match read_file_tail(path, LOG_READ_LIMIT).await {
            Ok(text) => Ok(tail_lines(&text, tail)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(anyhow::anyhow!("Failed to read {}: {}", path.display(), e)),
        }
    }

    async fn exec(&self, command: &[String]) -> anyhow::Result<CommandOutput> {
        let output = self.command(command)?.output().await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        debug!(command = ?command, status = %output.status, "Local command finished");
        Ok(CommandOutput {
            success: output.status.success(),
            output: combined,
        })
    }

    async fn exec_streaming(
        &self,
        command: &[String],
        lines: mpsc::Sender<String>,
    ) -> anyhow::Result<i64> {
        let mut child = self.command(command)?.spawn()?;
        debug!(command = ?command, pid = child.id().unwrap_or(0), "Local command spawned");

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(forward_lines(stderr, lines.clone())));

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, lines).await;
        } else {
            drop(lines);
        }

        if let Some(task) = stderr_task {
            let _ = task.await;
        }

        let status = child.wait().await?;
        Ok(status.code().map(i64::from).unwrap_or(-1))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_exec_captures_both_streams() {
        let backend = LocalBackend::default();
        let out = backend.exec(&sh("echo out; echo err >&2; exit 3")).await.unwrap();
        assert!(!out.success);
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[tokio::test]
    async fn test_exec_streaming_sends_lines() {
        let backend = LocalBackend::default();
        let (tx, mut rx) = mpsc::channel(16);
        let code = backend
            .exec_streaming(&sh("echo one; echo two >&2; echo three"), tx)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let mut received = Vec::new();
        while let Some(line) = rx.recv().await {
            received.push(line);
        }
        received.sort();
        assert_eq!(received, vec!["one", "three", "two"]);
    }

    #[tokio::test]
    async fn test_liveness_defaults_to_live() {
        let backend = LocalBackend::default();
        assert!(backend.is_live().await.unwrap());

        let backend = LocalBackend::default().with_liveness_command(sh("exit 1"));
        assert!(!backend.is_live().await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_logs_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        std::fs::write(&path, "a\nb\nc\nd\n").unwrap();

        let backend = LocalBackend::default().with_log_file(&path);
        assert_eq!(backend.fetch_logs(2).await.unwrap(), "c\nd");

        let missing = LocalBackend::default().with_log_file(dir.path().join("none.log"));
        assert_eq!(missing.fetch_logs(2).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_exec_streaming_survives_invalid_utf8() {
        let backend = LocalBackend::default();
        let (tx, mut rx) = mpsc::channel(64);
        let script = "printf 'bad \\377 byte\\n'; \
            i=0; while [ $i -lt 20000 ]; do \
            echo \"2024_01_01_000001_step_$i .... 1ms DONE\"; i=$((i+1)); done; exit 0";

        let collector = tokio::spawn(async move {
            let mut received = Vec::new();
            while let Some(line) = rx.recv().await {
                received.push(line);
            }
            received
        });

        let code = backend.exec_streaming(&sh(script), tx).await.unwrap();
        let received = collector.await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(received.len(), 20001);
        assert_eq!(received[0], "bad \u{FFFD} byte");
        assert!(received[20000].ends_with("DONE"));
    }

    #[tokio::test]
    async fn test_exec_streaming_drains_after_receiver_dropped() {
        let backend = LocalBackend::default();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let code = backend
            .exec_streaming(&sh("i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done"), tx)
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_fetch_logs_reads_only_the_end() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.log");
        let mut content = String::new();
        for i in 0..50_000 {
            content.push_str(&format!("line {:08}\n", i));
        }
        std::fs::write(&path, &content).unwrap();

        let text = read_file_tail(&path, 1024).await.unwrap();
        assert!(text.len() <= 1024);
        assert!(text.starts_with("line "));
        assert!(text.ends_with("line 00049999\n"));

        let backend = LocalBackend::default().with_log_file(&path);
        assert_eq!(
            backend.fetch_logs(2).await.unwrap(),
            "line 00049998\nline 00049999"
        );
    }

    #[tokio::test]
    async fn test_empty_command_is_error() {
        let backend = LocalBackend::default();
        assert!(backend.exec(&[]).await.is_err());
    }
}
