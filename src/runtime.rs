//! Process wiring: manifest loading, controller, diagnostics and signals.
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{AppConfig, ConfigError};
use crate::controller::{Controller, ShutdownReport};
use crate::diagnostics::{self, DiagnosticsError};
use crate::enums::Pipelines;
use crate::loader::{LoadError, LoadProgress, StreamingLoader};
use crate::logging::LoggingError;
use crate::systems::World;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("No manifest given: pass --yaml, set CPRA_MANIFEST or `manifest` in the config file")]
    NoManifest,
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error(transparent)]
    Logging(#[from] LoggingError),
    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),
    #[error("Failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),
}

impl RuntimeError {
    /// 1 for configuration and manifest problems, 2 for everything else.
    pub fn exit_code(&self) -> u8 {
        match self {
            RuntimeError::Config(_) | RuntimeError::NoManifest | RuntimeError::Load(_) => 1,
            _ => 2,
        }
    }
}

/// Command-line choices that override the config file.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub manifest: Option<PathBuf>,
    /// Serve diagnostics on this address.
    pub diagnostics: Option<SocketAddr>,
}

/// Runs until Ctrl-C or SIGTERM, then shuts down in the configured mode.
pub async fn run(config: AppConfig, options: Options) -> Result<ShutdownReport, RuntimeError> {
    let shutdown = CancellationToken::new();
    let signals = spawn_signal_watcher(shutdown.clone())?;
    let result = run_until(config, options, shutdown).await;
    signals.abort();
    result
}

/// Same as [`run`], but stops when `shutdown` is cancelled.
pub async fn run_until(
    config: AppConfig,
    options: Options,
    shutdown: CancellationToken,
) -> Result<ShutdownReport, RuntimeError> {
    let manifest = options
        .manifest
        .or_else(|| config.manifest.clone())
        .ok_or(RuntimeError::NoManifest)?;

    let (progress_tx, progress_rx) = mpsc::channel(16);
    let progress = tokio::spawn(log_progress(progress_rx));
    let mut world = World::new(config.controller.systems());
    let loaded = StreamingLoader::new(config.loader.clone())
        .with_progress(progress_tx)
        .load_file(&manifest, &mut world)
        .await;
    let _ = progress.await;
    let summary = loaded?;

    let diagnostics_addr = options
        .diagnostics
        .or(config.diagnostics.enabled.then_some(config.diagnostics.addr));
    let listener = match diagnostics_addr {
        Some(addr) => Some(diagnostics::bind(addr).await?),
        None => None,
    };

    let seeded = Pipelines {
        pulse: summary.pulse_rate,
        ..Pipelines::default()
    };
    let controller = Controller::start(world, config.controller_settings(seeded));

    let server = listener.map(|listener| {
        let snapshots = controller.snapshots();
        let stop = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = diagnostics::serve(listener, snapshots, stop).await {
                error!("{}", e);
            }
        })
    });

    let report = controller.run(shutdown.clone()).await;
    shutdown.cancel();
    if let Some(server) = server {
        let _ = server.await;
    }

    info!(
        mode = ?report.mode,
        ticks = report.ticks,
        dropped = report.dropped.pulse + report.dropped.intervention + report.dropped.code,
        late_results = report.late_results,
        clean = report.clean,
        "Shutdown complete."
    );
    Ok(report)
}

async fn log_progress(mut rx: mpsc::Receiver<LoadProgress>) {
    while let Some(progress) = rx.recv().await {
        info!(
            monitors = progress.monitors,
            batches = progress.batches,
            rate = progress.rate as u64,
            "Loading monitors..."
        );
    }
}

fn spawn_signal_watcher(shutdown: CancellationToken) -> Result<tokio::task::JoinHandle<()>, RuntimeError> {
    #[cfg(unix)]
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(RuntimeError::Signal)?;

    Ok(tokio::spawn(async move {
        #[cfg(unix)]
        let term = terminate.recv();
        #[cfg(not(unix))]
        let term = std::future::pending::<Option<()>>();

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    return;
                }
                info!("Received Ctrl-C.");
            }
            _ = term => info!("Received SIGTERM."),
        }
        shutdown.cancel();
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::StopMode;
    use std::io::Write;
    use std::time::Duration;

    fn manifest(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    fn small_config() -> AppConfig {
        let mut config = AppConfig::default();
        for pool in [&mut config.pools.pulse, &mut config.pools.intervention, &mut config.pools.code] {
            pool.min_workers = 1;
            pool.max_workers = 2;
        }
        config.controller.shutdown_mode = StopMode::Fast;
        config.controller.drain_timeout = Duration::from_secs(2);
        config
    }

    #[tokio::test]
    async fn missing_manifest_is_a_config_exit() {
        let err = run_until(AppConfig::default(), Options::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::NoManifest));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn broken_manifest_is_a_config_exit() {
        let file = manifest("monitors:\n  - name: a\n    pulse_check: {type: carrier-pigeon, interval: 1s, timeout: 1s}\n");
        let options = Options {
            manifest: Some(file.path().to_path_buf()),
            ..Options::default()
        };
        let err = run_until(small_config(), options, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Load(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn runs_fleet_until_cancelled() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let file = manifest(&format!(
            "monitors:\n  - name: local\n    pulse_check: {{type: tcp, interval: 100ms, timeout: 50ms, config: {{host: 127.0.0.1, port: {port}}}}}\n"
        ));
        let options = Options {
            manifest: Some(file.path().to_path_buf()),
            diagnostics: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
        };
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            stopper.cancel();
        });

        let report = run_until(small_config(), options, shutdown).await.unwrap();
        assert_eq!(report.mode, StopMode::Fast);
        assert!(report.ticks > 0);
        assert!(report.clean);
    }

    #[test]
    fn runtime_failures_exit_with_two() {
        let err = RuntimeError::Signal(std::io::Error::other("no signals here"));
        assert_eq!(err.exit_code(), 2);
    }
}
