use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
    #[error("Failed to bridge `log` records: {0}")]
    LogBridge(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    /// Filter directive; `RUST_LOG` applies when unset.
    pub level: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("logs"),
            level: None,
        }
    }
}

/// Picks the filter: configured level, then `RUST_LOG`, then `info` (`debug` with `--debug`).
pub fn env_filter(config: &LoggingConfig, debug: bool) -> EnvFilter {
    let fallback = if debug { "debug" } else { "info" };
    match &config.level {
        Some(directive) => EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(fallback)),
        None if debug => EnvFilter::new(fallback),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
    }
}

/// Installs the global subscriber. The returned guard flushes the file
/// writer when dropped, so `main` must hold it until exit.
pub fn init_logging(config: &LoggingConfig, debug: bool) -> Result<WorkerGuard, LoggingError> {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(&config.dir, "cpra.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().with_writer(file_writer).with_ansi(false).json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config, debug))
        .with(file_layer)
        .with(stdout_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    // This allows libraries using the `log` crate to work with `tracing`
    tracing_log::LogTracer::init().map_err(|e| LoggingError::LogBridge(e.to_string()))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::filter::LevelFilter;

    #[test]
    fn configured_level_wins_over_debug_flag() {
        let config = LoggingConfig {
            level: Some("warn".into()),
            ..LoggingConfig::default()
        };
        assert_eq!(env_filter(&config, true).max_level_hint(), Some(LevelFilter::WARN));
    }

    #[test]
    fn debug_flag_without_level() {
        assert_eq!(
            env_filter(&LoggingConfig::default(), true).max_level_hint(),
            Some(LevelFilter::DEBUG)
        );
    }

    #[test]
    fn bad_directive_falls_back() {
        let config = LoggingConfig {
            level: Some("cpra=loudest".into()),
            ..LoggingConfig::default()
        };
        assert_eq!(env_filter(&config, false).max_level_hint(), Some(LevelFilter::INFO));
    }
}
