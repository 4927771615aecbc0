//! Process configuration: built-in defaults, an optional TOML file, then
//! `CPRA_*` environment variables (after `.env` is loaded).
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::controller::{ControllerConfig, ControllerSettings, RingsConfig};
use crate::diagnostics::DiagnosticsConfig;
use crate::enums::{Pipeline, Pipelines};
use crate::loader::LoaderConfig;
use crate::logging::LoggingConfig;
use crate::pool::PoolConfig;
use crate::router::DEFAULT_RESULT_BUFFER;
use crate::sizing::SizingConfig;

/// Rough heap cost of one queued job, used to turn a memory cap into a ring limit.
pub const JOB_FOOTPRINT_BYTES: u64 = 256;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse TOML from config file at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Per-pipeline result channel capacity.
    pub buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            buffer: DEFAULT_RESULT_BUFFER,
        }
    }
}

/// Per-pipeline table where every entry is optional.
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
struct PartialPipelines<T> {
    pulse: Option<T>,
    intervention: Option<T>,
    code: Option<T>,
}

impl<T> Default for PartialPipelines<T> {
    fn default() -> Self {
        Self {
            pulse: None,
            intervention: None,
            code: None,
        }
    }
}

impl<T> PartialPipelines<T> {
    fn resolve(self, mut defaults: Pipelines<T>) -> Pipelines<T> {
        for (pipeline, value) in [
            (Pipeline::Pulse, self.pulse),
            (Pipeline::Intervention, self.intervention),
            (Pipeline::Code, self.code),
        ] {
            if let Some(value) = value {
                defaults[pipeline] = value;
            }
        }
        defaults
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PartialRings {
    capacity: PartialPipelines<usize>,
}

// Partial config for layering
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    manifest: Option<PathBuf>,
    memory_limit: Option<String>,
    controller: ControllerConfig,
    rings: PartialRings,
    pools: PartialPipelines<PoolConfig>,
    router: RouterConfig,
    sizing: SizingConfig,
    loader: LoaderConfig,
    logging: LoggingConfig,
    diagnostics: DiagnosticsConfig,
}

/// Variables read with the `CPRA_` prefix.
#[derive(Debug, Default, Deserialize)]
pub struct EnvOverrides {
    /// `CPRA_LOG`: a tracing filter directive.
    pub log: Option<String>,
    pub manifest: Option<PathBuf>,
    /// `CPRA_MEMORY_LIMIT`, e.g. `1GiB`.
    pub memory_limit: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub tick_rate_hz: Option<u32>,
}

impl EnvOverrides {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(envy::prefixed("CPRA_").from_env::<EnvOverrides>()?)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub manifest: Option<PathBuf>,
    /// Soft memory cap in bytes.
    pub memory_limit: Option<u64>,
    pub controller: ControllerConfig,
    pub rings: RingsConfig,
    pub pools: Pipelines<PoolConfig>,
    pub router: RouterConfig,
    pub sizing: SizingConfig,
    pub loader: LoaderConfig,
    pub logging: LoggingConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            manifest: None,
            memory_limit: None,
            controller: ControllerConfig::default(),
            rings: RingsConfig::default(),
            pools: Pipelines::default(),
            router: RouterConfig::default(),
            sizing: SizingConfig::default(),
            loader: LoaderConfig::default(),
            logging: LoggingConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads `.env`, reads the TOML file if it exists and applies `CPRA_*` overrides.
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        // 1. Load from file (optional)
        let contents = match config_path.map(Path::new) {
            Some(path) if path.exists() => Some(fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?),
            _ => None,
        };

        // 2. Load from environment variables
        let env = EnvOverrides::from_env()?;

        // 3. Merge: environment overrides file
        Self::from_parts(config_path.map(Path::new), contents.as_deref(), env)
    }

    /// Layers `contents` (TOML, if any) and `env` over the defaults.
    pub fn from_parts(path: Option<&Path>, contents: Option<&str>, env: EnvOverrides) -> Result<Self, ConfigError> {
        let file: FileConfig = match contents {
            Some(text) => toml::from_str(text).map_err(|source| ConfigError::Parse {
                path: path.map(Path::to_path_buf).unwrap_or_default(),
                source,
            })?,
            None => FileConfig::default(),
        };
        Self::resolve(file, env)
    }

    fn resolve(file: FileConfig, env: EnvOverrides) -> Result<Self, ConfigError> {
        let mut controller = file.controller;
        if let Some(hz) = env.tick_rate_hz {
            controller.tick_rate_hz = hz;
        }
        let mut logging = file.logging;
        if let Some(dir) = env.log_dir {
            logging.dir = dir;
        }
        if let Some(filter) = env.log {
            logging.level = Some(filter);
        }

        let memory_limit = env
            .memory_limit
            .or(file.memory_limit)
            .map(|raw| {
                parse_byte_size(&raw).map_err(|reason| ConfigError::Invalid {
                    field: "memory_limit",
                    reason,
                })
            })
            .transpose()?;

        let mut rings = RingsConfig::default();
        rings.capacity = file.rings.capacity.resolve(rings.capacity);
        rings.soft_limit = memory_limit.map(ring_soft_limit);

        let config = AppConfig {
            manifest: env.manifest.or(file.manifest),
            memory_limit,
            controller,
            rings,
            pools: file.pools.resolve(Pipelines::default()),
            router: file.router,
            sizing: file.sizing,
            loader: file.loader,
            logging,
            diagnostics: file.diagnostics,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if !(1..=10_000).contains(&self.controller.tick_rate_hz) {
            return invalid("controller.tick_rate_hz", "must be between 1 and 10000");
        }
        if self.controller.sizing_interval.is_zero() || self.controller.queue_switch_interval.is_zero() {
            return invalid("controller intervals", "must be greater than zero");
        }
        if self.rings.capacity.iter().any(|(_, c)| *c == 0) {
            return invalid("rings.capacity", "must be at least 1");
        }
        for (pipeline, pool) in self.pools.iter() {
            if pool.max_workers == 0 || pool.min_workers > pool.max_workers {
                return Err(ConfigError::Invalid {
                    field: "pools",
                    reason: format!("{pipeline}: need 0 < min_workers <= max_workers"),
                });
            }
        }
        if self.router.buffer == 0 {
            return invalid("router.buffer", "must be at least 1");
        }
        if self.loader.parse_batch == 0 {
            return invalid("loader.parse_batch", "must be at least 1");
        }
        if !(0.0..=10.0).contains(&self.sizing.headroom) {
            return invalid("sizing.headroom", "must be between 0 and 10");
        }
        Ok(())
    }

    /// Everything [`Controller::start`](crate::controller::Controller::start) needs.
    pub fn controller_settings(&self, seeded_rates: Pipelines<f64>) -> ControllerSettings {
        ControllerSettings {
            controller: self.controller.clone(),
            rings: self.rings.clone(),
            pools: self.pools.clone(),
            router_buffer: self.router.buffer,
            sizing: self.sizing.clone(),
            seeded_rates,
        }
    }
}

/// Per-ring job cap for a process-wide memory limit, split evenly across pipelines.
pub fn ring_soft_limit(memory_limit: u64) -> usize {
    let jobs = memory_limit / JOB_FOOTPRINT_BYTES / Pipeline::ALL.len() as u64;
    usize::try_from(jobs).unwrap_or(usize::MAX).max(1)
}

/// Parses sizes like `512MiB`, `1GiB`, `2GB`, `64k` or a plain byte count.
/// IEC units and bare letters are powers of 1024; SI units powers of 1000.
pub fn parse_byte_size(input: &str) -> Result<u64, String> {
    let s = input.trim();
    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, unit) = s.split_at(split);
    let value: f64 = number
        .parse()
        .map_err(|_| format!("'{input}' is not a size"))?;
    let multiplier: u64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1,
        "k" | "kib" => 1 << 10,
        "m" | "mib" => 1 << 20,
        "g" | "gib" => 1 << 30,
        "t" | "tib" => 1 << 40,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        other => return Err(format!("unknown unit '{other}' in '{input}'")),
    };
    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes < 1.0 {
        return Err(format!("'{input}' must be at least one byte"));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::StopMode;
    use std::time::Duration;

    fn from_toml(text: &str) -> Result<AppConfig, ConfigError> {
        AppConfig::from_parts(Some(Path::new("cpra.toml")), Some(text), EnvOverrides::default())
    }

    #[test]
    fn defaults_without_file_or_env() {
        let config = AppConfig::from_parts(None, None, EnvOverrides::default()).unwrap();
        assert_eq!(config.controller.tick_rate_hz, 100);
        assert_eq!(config.rings.capacity.intervention, 4096);
        assert_eq!(config.rings.soft_limit, None);
        assert_eq!(config.pools.code.min_workers, 5);
        assert_eq!(config.loader.parse_batch, 1000);
        assert!(config.manifest.is_none());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = from_toml(
            r#"
manifest = "monitors.yaml"

[controller]
sizing_interval = "1m30s"
shutdown_mode = "fast"

[rings.capacity]
pulse = 1024

[pools.pulse]
max_workers = 64
target_latency = "250ms"

[diagnostics]
enabled = true
addr = "0.0.0.0:7070"
"#,
        )
        .unwrap();
        assert_eq!(config.manifest, Some(PathBuf::from("monitors.yaml")));
        assert_eq!(config.controller.sizing_interval, Duration::from_secs(90));
        assert_eq!(config.controller.shutdown_mode, StopMode::Fast);
        assert_eq!(config.controller.tick_rate_hz, 100);
        assert_eq!(config.rings.capacity.pulse, 1024);
        assert_eq!(config.rings.capacity.code, 16384);
        assert_eq!(config.pools.pulse.max_workers, 64);
        assert_eq!(config.pools.pulse.target_latency, Duration::from_millis(250));
        assert_eq!(config.pools.intervention.max_workers, PoolConfig::default().max_workers);
        assert!(config.diagnostics.enabled);
        assert_eq!(config.diagnostics.addr.port(), 7070);
    }

    #[test]
    fn environment_overrides_file() {
        let env = EnvOverrides {
            log: Some("debug".into()),
            manifest: Some("/etc/cpra/fleet.json".into()),
            memory_limit: Some("768MiB".into()),
            log_dir: Some("/var/log/cpra".into()),
            tick_rate_hz: Some(250),
        };
        let text = "manifest = \"local.yaml\"\nmemory_limit = \"1GiB\"\n[controller]\ntick_rate_hz = 50\n";
        let config = AppConfig::from_parts(None, Some(text), env).unwrap();
        assert_eq!(config.manifest, Some(PathBuf::from("/etc/cpra/fleet.json")));
        assert_eq!(config.controller.tick_rate_hz, 250);
        assert_eq!(config.memory_limit, Some(768 << 20));
        assert_eq!(config.rings.soft_limit, Some(ring_soft_limit(768 << 20)));
        assert_eq!(config.logging.dir, PathBuf::from("/var/log/cpra"));
        assert_eq!(config.logging.level.as_deref(), Some("debug"));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(from_toml("[controller]\ntick_rate_hz = 0\n"), Err(ConfigError::Invalid { .. })));
        assert!(matches!(
            from_toml("[pools.code]\nmin_workers = 10\nmax_workers = 2\n"),
            Err(ConfigError::Invalid { field: "pools", .. })
        ));
        assert!(matches!(from_toml("memory_limit = \"lots\"\n"), Err(ConfigError::Invalid { .. })));
        assert!(matches!(from_toml("[controller\n"), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            from_toml("[controller]\nsizing_interval = \"5 parsecs\"\n"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn byte_sizes() {
        assert_eq!(parse_byte_size("1GiB"), Ok(1 << 30));
        assert_eq!(parse_byte_size("1.5g"), Ok(3 << 29));
        assert_eq!(parse_byte_size("2GB"), Ok(2_000_000_000));
        assert_eq!(parse_byte_size("4096"), Ok(4096));
        assert_eq!(parse_byte_size(" 64 KiB "), Ok(64 << 10));
        assert!(parse_byte_size("GiB").is_err());
        assert!(parse_byte_size("1PiB").is_err());
        assert!(parse_byte_size("0").is_err());
    }

    #[test]
    fn soft_limit_splits_memory_across_rings() {
        assert_eq!(ring_soft_limit(3 * 256 * 1000), 1000);
        assert_eq!(ring_soft_limit(1), 1);
    }
}
