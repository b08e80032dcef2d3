use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the front door
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front door listener and pages
    #[serde(default)]
    pub server: ServerConfig,

    /// The slow backend being fronted
    #[serde(default)]
    pub backend: BackendConfig,

    /// Files persisted outside process memory
    #[serde(default)]
    pub state: StateConfig,

    /// Readiness monitor loop settings
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// One-shot initialization task settings
    #[serde(default)]
    pub init: InitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Port the front door listens on (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path of the status API endpoint
    #[serde(default = "default_status_path")]
    pub status_path: String,

    /// HTML template served while the backend is not ready.
    /// A built-in page is used when unset or unreadable.
    pub loading_page: Option<String>,

    /// HTML page shown once on the first root request after readiness
    pub instructions_page: Option<String>,

    /// Backend path proxied for `GET /` when the instructions page has not
    /// been shown but its template cannot be read (e.g. "/installer")
    pub setup_fallback_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            status_path: default_status_path(),
            loading_page: None,
            instructions_page: None,
            setup_fallback_path: None,
        }
    }
}

/// How backend commands are executed
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Commands run on this host (default)
    #[default]
    Local,
    /// Commands exec'd inside a running Docker container
    Docker,
}

/// Configuration for the fronted backend
///
/// # Security Warning
///
/// The command fields are executed verbatim. Configuration files must be
/// protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Backend type: "local" (default) or "docker"
    #[serde(default, rename = "type")]
    pub backend_type: BackendType,

    /// Internal host the backend listens on
    #[serde(default = "default_backend_host")]
    pub host: String,

    /// Internal port the backend listens on (default: 8090)
    #[serde(default = "default_backend_port")]
    pub port: u16,

    /// Health probe paths, tried in order
    #[serde(default = "default_health_paths")]
    pub health_paths: Vec<String>,

    /// Request timeout for proxied requests in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Env files searched for the backend's published `APP_URL`
    #[serde(default)]
    pub app_env_files: Vec<String>,

    // === Docker-specific fields ===
    /// Container name the backend runs in (docker only)
    pub container: Option<String>,

    /// Docker host URL (default: local socket)
    pub docker_host: Option<String>,

    // === Local-specific fields ===
    /// Log file tailed for phase classification (local only)
    pub log_file: Option<String>,

    /// Working directory for commands (local only)
    pub working_dir: Option<String>,

    // === Commands ===
    /// Command whose success means the backend is live.
    /// Local backends without one are always considered live.
    #[serde(default)]
    pub liveness_command: Vec<String>,

    /// Command run before initialization to verify the backend accepts commands
    #[serde(default)]
    pub readiness_command: Vec<String>,

    /// Text the readiness command output must contain
    pub readiness_output: Option<String>,

    /// Command that reports already-applied initialization state
    #[serde(default = "default_state_command")]
    pub state_command: Vec<String>,

    /// The one-shot initialization command
    #[serde(default = "default_init_command")]
    pub init_command: Vec<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: BackendType::default(),
            host: default_backend_host(),
            port: default_backend_port(),
            health_paths: default_health_paths(),
            request_timeout_secs: default_request_timeout(),
            app_env_files: Vec::new(),
            container: None,
            docker_host: None,
            log_file: None,
            working_dir: None,
            liveness_command: Vec::new(),
            readiness_command: Vec::new(),
            readiness_output: None,
            state_command: default_state_command(),
            init_command: default_init_command(),
        }
    }
}

impl BackendConfig {
    /// Create a local backend config with the given commands
    pub fn local(port: u16, state_command: Vec<String>, init_command: Vec<String>) -> Self {
        Self {
            port,
            state_command,
            init_command,
            ..Self::default()
        }
    }

    /// Create a Docker backend config for a named container
    pub fn docker(container: &str, port: u16) -> Self {
        Self {
            backend_type: BackendType::Docker,
            port,
            container: Some(container.to_string()),
            ..Self::default()
        }
    }

    /// Internal origin as `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.backend_type == BackendType::Docker && self.container.is_none() {
            errors.push("backend: docker backend requires 'container' field".to_string());
        }
        if self.port == 0 {
            errors.push("backend: 'port' must be greater than 0".to_string());
        }
        if self.init_command.is_empty() {
            errors.push("backend: 'init_command' must not be empty".to_string());
        }
        if self.state_command.is_empty() {
            errors.push("backend: 'state_command' must not be empty".to_string());
        }
        if self.health_paths.is_empty() {
            errors.push("backend: 'health_paths' must list at least one path".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    /// Directory holding the persisted files
    #[serde(default = "default_state_dir")]
    pub dir: String,

    /// Initialization-complete flag, relative to `dir`
    #[serde(default = "default_init_flag")]
    pub init_flag: String,

    /// Structured status document published by an external watcher, relative to `dir`
    #[serde(default = "default_status_file")]
    pub status_file: String,

    /// Marker created once the instructions page was shown, relative to `dir`
    #[serde(default = "default_setup_marker")]
    pub setup_marker: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            init_flag: default_init_flag(),
            status_file: default_status_file(),
            setup_marker: default_setup_marker(),
        }
    }
}

impl StateConfig {
    /// State rooted in the given directory with default file names
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    pub fn init_flag_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.init_flag)
    }

    pub fn status_file_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.status_file)
    }

    pub fn setup_marker_path(&self) -> PathBuf {
        Path::new(&self.dir).join(&self.setup_marker)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    /// Interval between monitor iterations in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub interval_ms: u64,

    /// Maximum age of the status document in seconds
    #[serde(default = "default_freshness")]
    pub freshness_secs: u64,

    /// Consecutive successful probes required before ready
    #[serde(default = "default_ready_threshold")]
    pub ready_threshold: u32,

    /// Number of log lines fetched for classification
    #[serde(default = "default_log_tail")]
    pub log_tail: usize,

    /// Timeout for the liveness check in seconds
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,

    /// Timeout for fetching logs in seconds
    #[serde(default = "default_log_timeout")]
    pub log_timeout_secs: u64,

    /// Timeout for each health probe request in seconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_monitor_interval(),
            freshness_secs: default_freshness(),
            ready_threshold: default_ready_threshold(),
            log_tail: default_log_tail(),
            liveness_timeout_secs: default_liveness_timeout(),
            log_timeout_secs: default_log_timeout(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    pub fn log_timeout(&self) -> Duration {
        Duration::from_secs(self.log_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct InitConfig {
    /// Built-in estimate of the number of tasks the init command completes
    #[serde(default = "default_total_estimate")]
    pub total_estimate: u32,

    /// Maximum time to wait for the backend to accept commands, in seconds
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,

    /// Poll interval while waiting for the backend, in milliseconds
    #[serde(default = "default_wait_interval")]
    pub wait_interval_ms: u64,

    /// Timeout for the existing-state check in seconds
    #[serde(default = "default_state_check_timeout")]
    pub state_check_timeout_secs: u64,

    /// Completed-marker count the state check must exceed to count as done
    #[serde(default = "default_sanity_threshold")]
    pub sanity_threshold: usize,

    /// Upper bound for the whole init task in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Silence on the init output after which a warning is logged, in seconds
    #[serde(default = "default_line_timeout")]
    pub line_timeout_secs: u64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            total_estimate: default_total_estimate(),
            wait_timeout_secs: default_wait_timeout(),
            wait_interval_ms: default_wait_interval(),
            state_check_timeout_secs: default_state_check_timeout(),
            sanity_threshold: default_sanity_threshold(),
            task_timeout_secs: default_task_timeout(),
            line_timeout_secs: default_line_timeout(),
        }
    }
}

impl InitConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout_secs)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_millis(self.wait_interval_ms)
    }

    pub fn state_check_timeout(&self) -> Duration {
        Duration::from_secs(self.state_check_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn line_timeout(&self) -> Duration {
        Duration::from_secs(self.line_timeout_secs)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_status_path() -> String {
    "/api/loading-status".to_string()
}

fn default_backend_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_port() -> u16 {
    8090
}

fn default_health_paths() -> Vec<String> {
    vec!["/".to_string(), "/api/health".to_string()]
}

fn default_request_timeout() -> u64 {
    30
}

fn default_state_command() -> Vec<String> {
    ["php", "artisan", "migrate:status", "--no-interaction"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_init_command() -> Vec<String> {
    ["php", "artisan", "migrate", "--force", "--no-interaction"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_state_dir() -> String {
    "./var".to_string()
}

fn default_init_flag() -> String {
    "init_complete".to_string()
}

fn default_status_file() -> String {
    "init_status.json".to_string()
}

fn default_setup_marker() -> String {
    "setup_shown".to_string()
}

fn default_monitor_interval() -> u64 {
    2000
}

fn default_freshness() -> u64 {
    60
}

fn default_ready_threshold() -> u32 {
    3
}

fn default_log_tail() -> usize {
    1000
}

fn default_liveness_timeout() -> u64 {
    5
}

fn default_log_timeout() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_total_estimate() -> u32 {
    222
}

fn default_wait_timeout() -> u64 {
    120
}

fn default_wait_interval() -> u64 {
    2000
}

fn default_state_check_timeout() -> u64 {
    30
}

fn default_sanity_threshold() -> usize {
    10
}

fn default_task_timeout() -> u64 {
    3600
}

fn default_line_timeout() -> u64 {
    120
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Apply positional startup parameters: `[listen_port] [backend_port] [loading_page]`
    pub fn apply_args<S: AsRef<str>>(&mut self, args: &[S]) -> anyhow::Result<()> {
        if let Some(port) = args.first() {
            self.server.port = port
                .as_ref()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid listen port '{}': {}", port.as_ref(), e))?;
        }
        if let Some(port) = args.get(1) {
            self.backend.port = port
                .as_ref()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid backend port '{}': {}", port.as_ref(), e))?;
        }
        if let Some(page) = args.get(2) {
            self.server.loading_page = Some(page.as_ref().to_string());
        }
        Ok(())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(backend_errors) = self.backend.validate() {
            errors.extend(backend_errors);
        }
        if self.monitor.ready_threshold == 0 {
            errors.push("monitor: 'ready_threshold' must be greater than 0".to_string());
        }
        if self.monitor.interval_ms == 0 {
            errors.push("monitor: 'interval_ms' must be greater than 0".to_string());
        }
        if let Some(ref path) = self.server.setup_fallback_path {
            if !path.starts_with('/') {
                errors.push("server: 'setup_fallback_path' must start with '/'".to_string());
            }
        }
        if self.init.total_estimate == 0 {
            errors.push("init: 'total_estimate' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
