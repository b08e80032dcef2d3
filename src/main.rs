use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use warmgate::marker::Marker;
use warmgate::status_source::StatusSource;
use warmgate::{
    AnyBackend, Config, FrontDoor, HealthProbe, InitRunner, ReadinessMonitor, SharedState,
};

/// Environment variable naming the TOML configuration file
const CONFIG_ENV: &str = "WARMGATE_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("warmgate=debug".parse()?),
        )
        .init();

    let mut config = match std::env::var_os(CONFIG_ENV).map(PathBuf::from) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => Config::default(),
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    config.apply_args(&args)?;
    config.validate()?;

    info!(
        listen_port = config.server.port,
        backend = %config.backend.authority(),
        backend_type = ?config.backend.backend_type,
        state_dir = %config.state.dir,
        "Starting warmgate"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let backend = Arc::new(AnyBackend::from_config(&config.backend).await?);
    let state = SharedState::new();

    let init = Arc::new(InitRunner::new(
        Arc::clone(&backend),
        state.clone(),
        Marker::new(config.state.init_flag_path()),
        &config.backend,
        config.init.clone(),
    ));

    let probe = HealthProbe::new(
        config.backend.authority(),
        config.backend.health_paths.clone(),
        config.monitor.probe_timeout(),
    );

    let monitor = ReadinessMonitor::new(
        backend,
        probe,
        state.clone(),
        init,
        StatusSource::new(config.state.status_file_path(), config.monitor.freshness()),
        config.monitor.clone(),
    );

    let front_door = FrontDoor::from_config(&config, state, shutdown_rx.clone())?;

    let monitor_shutdown = shutdown_rx.clone();
    let monitor_handle = tokio::spawn(async move {
        monitor.run(monitor_shutdown).await;
    });

    let front_door_handle = tokio::spawn(async move {
        if let Err(e) = front_door.run().await {
            error!(error = %e, "Front door error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = front_door_handle.await;
        let _ = monitor_handle.await;
    })
    .await;

    info!("Shutdown complete");
    Ok(())
}
