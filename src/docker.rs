//! Docker backend: commands exec'd inside a running container

use crate::backend::{tail_lines, Backend, CommandOutput, LineBuffer};
use crate::config::BackendConfig;
use bollard::container::{InspectContainerOptions, LogOutput, LogsOptions};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Backend running in a named container
pub struct DockerBackend {
    client: Docker,
    container: String,
}

impl DockerBackend {
    /// Connect to the Docker daemon for the configured container
    ///
    /// Connection priority:
    /// 1. Explicit docker_host
    /// 2. DOCKER_HOST environment variable
    /// 3. bollard's local defaults
    pub async fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        let container = config
            .container
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Docker backend requires 'container' field"))?;

        let client = if let Some(ref host) = config.docker_host {
            connect_to_host(host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Docker::connect_with_local_defaults()
                .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))?
        };

        // The daemon may come up after us; liveness checks retry on every tick
        if let Err(e) = client.ping().await {
            warn!(error = %e, "Docker daemon is not responding yet");
        }

        debug!(container = %container, "Docker backend configured");
        Ok(Self { client, container })
    }

    async fn start_exec(
        &self,
        command: &[String],
    ) -> anyhow::Result<(String, StartExecResults)> {
        let options = CreateExecOptions {
            cmd: Some(command.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.client.create_exec(&self.container, options).await?;
        let results = self.client.start_exec(&exec.id, None).await?;
        Ok((exec.id, results))
    }

    async fn exit_code(&self, exec_id: &str) -> anyhow::Result<i64> {
        let inspect = self.client.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code.unwrap_or(-1))
    }
}

fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
    if let Some(socket_path) = host.strip_prefix("unix://") {
        Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
    } else if host.starts_with("tcp://") || host.starts_with("http://") {
        Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
            .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
    } else {
        anyhow::bail!(
            "Invalid docker_host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
            host
        )
    }
}

fn log_bytes(output: &LogOutput) -> Option<&[u8]> {
    match output {
        LogOutput::StdOut { message }
        | LogOutput::StdErr { message }
        | LogOutput::Console { message } => Some(message.as_ref()),
        LogOutput::StdIn { .. } => None,
    }
}

impl Backend for DockerBackend {
    async fn is_live(&self) -> anyhow::Result<bool> {
        match self
            .client
            .inspect_container(&self.container, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn fetch_logs(&self, tail: usize) -> anyhow::Result<String> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            timestamps: false,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.client.logs(&self.container, Some(options));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            if let Some(bytes) = log_bytes(&chunk?) {
                text.push_str(&String::from_utf8_lossy(bytes));
            }
        }
        Ok(tail_lines(&text, tail))
    }

    async fn exec(&self, command: &[String]) -> anyhow::Result<CommandOutput> {
        let (exec_id, results) = self.start_exec(command).await?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } = results {
            while let Some(chunk) = stream.next().await {
                if let Some(bytes) = log_bytes(&chunk?) {
                    output.push_str(&String::from_utf8_lossy(bytes));
                }
            }
        }

        let code = self.exit_code(&exec_id).await?;
        debug!(container = %self.container, command = ?command, code, "Exec finished");
        Ok(CommandOutput {
            success: code == 0,
            output,
        })
    }

    async fn exec_streaming(
        &self,
        command: &[String],
        lines: mpsc::Sender<String>,
    ) -> anyhow::Result<i64> {
        let (exec_id, results) = self.start_exec(command).await?;

        if let StartExecResults::Attached { output: mut stream, .. } = results {
            let mut buffer = LineBuffer::default();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                let Some(bytes) = log_bytes(&chunk) else {
                    continue;
                };
                for line in buffer.push(bytes) {
                    // Keep draining the exec even if nobody listens
                    let _ = lines.send(line).await;
                }
            }
            if let Some(rest) = buffer.finish() {
                let _ = lines.send(rest).await;
            }
        }
        drop(lines);

        self.exit_code(&exec_id).await
    }
}
