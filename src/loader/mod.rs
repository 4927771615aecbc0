//! Streaming manifest loader.
//!
//! The manifest is deserialized on a blocking thread with a
//! [`DeserializeSeed`] that never materializes the whole monitor list: specs
//! are cut into batches of `parse_batch` and handed to the async side over a
//! small bounded channel, which validates them, builds their task templates
//! and inserts the records into the [`World`].
//!
//! Only JSON is read incrementally. `serde_yaml` buffers the whole document
//! and its event stream before the first spec comes out, so a YAML manifest
//! costs its full size in memory on top of the batches in flight.
use serde::de::{self, DeserializeSeed, Deserializer, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::jobs::templates::{build_templates, Templates};
use crate::manifest::{ManifestError, MonitorSpec};
use crate::monitor::{CodeRoute, InterventionRoute, MonitorRecord, PulseSettings, StoreError};
use crate::systems::World;

/// Batches buffered between the parser thread and the store.
const BATCH_QUEUE: usize = 4;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to open manifest {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unsupported manifest format: {0} (expected .yaml, .yml or .json)")]
    UnsupportedFormat(PathBuf),
    #[error("Invalid YAML manifest: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid JSON manifest: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Manifest parser task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Format::Yaml),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Monitors per batch handed from the parser to the store.
    pub parse_batch: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self { parse_batch: 1000 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadProgress {
    pub monitors: usize,
    pub batches: usize,
    /// Monitors per second so far.
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSummary {
    pub monitors: usize,
    pub disabled: usize,
    pub batches: usize,
    /// Σ 1/interval over enabled monitors: the expected pulse arrival rate.
    pub pulse_rate: f64,
    pub elapsed: Duration,
}

pub struct StreamingLoader {
    config: LoaderConfig,
    progress: Option<mpsc::Sender<LoadProgress>>,
}

impl StreamingLoader {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config, progress: None }
    }

    /// Progress updates are best-effort; a full channel skips one.
    pub fn with_progress(mut self, tx: mpsc::Sender<LoadProgress>) -> Self {
        self.progress = Some(tx);
        self
    }

    pub async fn load_file(&self, path: &Path, world: &mut World) -> Result<LoadSummary, LoadError> {
        let format = Format::from_path(path).ok_or_else(|| LoadError::UnsupportedFormat(path.to_path_buf()))?;
        let file = File::open(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let batch_size = self.config.parse_batch.max(1);
        let (tx, mut rx) = mpsc::channel::<Vec<MonitorSpec>>(BATCH_QUEUE);
        info!(path = %path.display(), ?format, batch_size, "Loading manifest.");

        let parser = tokio::task::spawn_blocking(move || parse(format, BufReader::new(file), batch_size, &tx));

        let started = Instant::now();
        let mut summary = LoadSummary::default();
        while let Some(batch) = rx.recv().await {
            // Dropping `rx` on error stops the parser at its next send.
            self.apply_batch(batch, world, &mut summary)?;
            self.report(&summary, started);
        }
        parser.await??;

        summary.elapsed = started.elapsed();
        info!(
            monitors = summary.monitors,
            disabled = summary.disabled,
            batches = summary.batches,
            pulse_rate = summary.pulse_rate,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Manifest loaded."
        );
        Ok(summary)
    }

    fn apply_batch(
        &self,
        batch: Vec<MonitorSpec>,
        world: &mut World,
        summary: &mut LoadSummary,
    ) -> Result<(), LoadError> {
        world.store_mut().reserve(batch.len());
        let now = tokio::time::Instant::now();
        for spec in batch {
            spec.validate(summary.monitors)?;
            let templates = build_templates(&spec)?;
            let record = build_record(&spec, templates);
            world.insert(record, now)?;
            summary.monitors += 1;
            if spec.enabled {
                summary.pulse_rate += spec.pulse_check.rate();
            } else {
                summary.disabled += 1;
            }
        }
        summary.batches += 1;
        debug!(batch = summary.batches, total = summary.monitors, "Manifest batch stored.");
        Ok(())
    }

    fn report(&self, summary: &LoadSummary, started: Instant) {
        let Some(tx) = &self.progress else { return };
        let secs = started.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { summary.monitors as f64 / secs } else { 0.0 };
        let _ = tx.try_send(LoadProgress {
            monitors: summary.monitors,
            batches: summary.batches,
            rate,
        });
    }
}

/// Turns a validated spec and its templates into a fresh record.
pub fn build_record(spec: &MonitorSpec, templates: Templates) -> MonitorRecord {
    let pulse = &spec.pulse_check;
    let settings = PulseSettings {
        kind: pulse.kind,
        interval: pulse.interval,
        timeout: pulse.timeout,
        retries: pulse.retries,
        unhealthy_threshold: pulse.max_failures,
        healthy_threshold: pulse.healthy_threshold,
    };
    let mut record = MonitorRecord::new(spec.name.as_str(), settings, templates.pulse);

    if let (Some(intervention), Some(task)) = (&spec.intervention, templates.intervention) {
        record = record.with_intervention(InterventionRoute {
            action: intervention.action,
            max_failures: intervention.retries,
            task,
        });
    }
    for (color, code) in &spec.codes {
        if let Some(task) = templates.codes[*color].clone() {
            record = record.with_code(
                *color,
                CodeRoute {
                    notify: code.notify,
                    dispatch: code.dispatch,
                    cooldown: code.cooldown.unwrap_or_default(),
                    task,
                },
            );
        }
    }
    if !spec.enabled {
        record = record.disabled();
    }
    record
}

fn parse(
    format: Format,
    reader: BufReader<File>,
    batch_size: usize,
    tx: &mpsc::Sender<Vec<MonitorSpec>>,
) -> Result<usize, LoadError> {
    let seed = ManifestSeed { batch_size, tx };
    match format {
        Format::Json => {
            let mut de = serde_json::Deserializer::from_reader(reader);
            let count = seed.deserialize(&mut de)?;
            de.end()?;
            Ok(count)
        }
        Format::Yaml => Ok(seed.deserialize(serde_yaml::Deserializer::from_reader(reader))?),
    }
}

/// Top level of the manifest: walks the map and streams `monitors`.
#[derive(Clone, Copy)]
struct ManifestSeed<'a> {
    batch_size: usize,
    tx: &'a mpsc::Sender<Vec<MonitorSpec>>,
}

impl<'de> DeserializeSeed<'de> for ManifestSeed<'_> {
    type Value = usize;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<usize, D::Error> {
        deserializer.deserialize_map(self)
    }
}

impl<'de> Visitor<'de> for ManifestSeed<'_> {
    type Value = usize;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a manifest with a `monitors` list")
    }

    // An empty YAML document.
    fn visit_unit<E: de::Error>(self) -> Result<usize, E> {
        Ok(0)
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<usize, A::Error> {
        let mut total = 0;
        while let Some(key) = map.next_key::<String>()? {
            if key == "monitors" {
                total += map.next_value_seed(MonitorsSeed(self))?;
            } else {
                map.next_value::<IgnoredAny>()?;
            }
        }
        Ok(total)
    }
}

struct MonitorsSeed<'a>(ManifestSeed<'a>);

impl<'de> DeserializeSeed<'de> for MonitorsSeed<'_> {
    type Value = usize;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<usize, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for MonitorsSeed<'_> {
    type Value = usize;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a list of monitors")
    }

    fn visit_unit<E: de::Error>(self) -> Result<usize, E> {
        Ok(0)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<usize, A::Error> {
        let ManifestSeed { batch_size, tx } = self.0;
        let mut total = 0;
        let mut batch = Vec::with_capacity(batch_size);
        while let Some(spec) = seq.next_element::<MonitorSpec>()? {
            batch.push(spec);
            total += 1;
            if batch.len() == batch_size {
                let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_size));
                tx.blocking_send(full).map_err(|_| de::Error::custom("loader stopped"))?;
            }
        }
        if !batch.is_empty() {
            tx.blocking_send(batch).map_err(|_| de::Error::custom("loader stopped"))?;
        }
        Ok(total)
    }
}
