//! Monitor manifest schema (YAML or JSON) and its validation.
//!
//! Kind-specific sections (`pulse_check.config`, `intervention.target`,
//! `codes.<color>.config`) stay as raw values until the monitor's task
//! templates are built, where they are decoded into the typed config of the
//! selected kind.
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::duration;
use crate::enums::{ActionKind, Color, NotifyKind, PulseKind};
use crate::interventions::ActionConfig;
use crate::notifications::ChannelConfig;
use crate::probes::ProbeConfig;

pub const MAX_NAME_LEN: usize = 100;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Monitor #{index}: name must be 1 to {MAX_NAME_LEN} characters")]
    InvalidName { index: usize },
    #[error("Monitor '{monitor}': {field} {reason}")]
    InvalidField {
        monitor: String,
        field: &'static str,
        reason: String,
    },
    #[error("Monitor '{monitor}': invalid {section} config: {source}")]
    Config {
        monitor: String,
        section: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSpec {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub pulse_check: PulseSpec,
    #[serde(default)]
    pub intervention: Option<InterventionSpec>,
    #[serde(default)]
    pub codes: BTreeMap<Color, CodeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PulseSpec {
    #[serde(rename = "type")]
    pub kind: PulseKind,
    #[serde(with = "duration::serde_str")]
    pub interval: Duration,
    #[serde(with = "duration::serde_str")]
    pub timeout: Duration,
    /// U: consecutive failures before the monitor is unhealthy.
    #[serde(default = "default_one")]
    pub max_failures: u32,
    /// H: consecutive successes that close an incident.
    #[serde(default = "default_one")]
    pub healthy_threshold: u32,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterventionSpec {
    pub action: ActionKind,
    /// M: failed attempts before escalating to red.
    #[serde(default = "default_one")]
    pub retries: u32,
    #[serde(default)]
    pub target: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodeSpec {
    #[serde(default)]
    pub dispatch: bool,
    pub notify: NotifyKind,
    #[serde(default, with = "duration::serde_opt")]
    pub cooldown: Option<Duration>,
    #[serde(default)]
    pub config: Value,
}

fn default_enabled() -> bool {
    true
}

fn default_one() -> u32 {
    1
}

/// Decodes `config` into a `#[serde(tag = "type")]` enum, using `tag` as the variant.
pub(crate) fn decode_tagged<T: DeserializeOwned>(tag: &str, config: &Value) -> Result<T, serde_json::Error> {
    let mut object = match config {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected a map, found {}",
                value_kind(other)
            )));
        }
    };
    object.insert("type".to_string(), Value::String(tag.to_string()));
    serde_json::from_value(Value::Object(object))
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a map",
    }
}

impl PulseSpec {
    /// Reciprocal interval; the loader sums these to seed the pulse arrival rate.
    pub fn rate(&self) -> f64 {
        1.0 / self.interval.as_secs_f64().max(1e-3)
    }
}

impl MonitorSpec {
    pub fn probe_config(&self) -> Result<ProbeConfig, ManifestError> {
        decode_tagged(&self.pulse_check.kind.to_string(), &self.pulse_check.config).map_err(|source| {
            ManifestError::Config {
                monitor: self.name.clone(),
                section: "pulse_check".to_string(),
                source,
            }
        })
    }

    pub fn action_config(&self) -> Result<Option<ActionConfig>, ManifestError> {
        let Some(intervention) = &self.intervention else {
            return Ok(None);
        };
        decode_tagged(&intervention.action.to_string(), &intervention.target)
            .map(Some)
            .map_err(|source| ManifestError::Config {
                monitor: self.name.clone(),
                section: "intervention".to_string(),
                source,
            })
    }

    pub fn channel_config(&self, color: Color) -> Result<Option<ChannelConfig>, ManifestError> {
        let Some(code) = self.codes.get(&color) else {
            return Ok(None);
        };
        decode_tagged(&code.notify.to_string(), &code.config)
            .map(Some)
            .map_err(|source| ManifestError::Config {
                monitor: self.name.clone(),
                section: format!("codes.{color}"),
                source,
            })
    }

    /// Name and threshold checks. The kind-specific sections are checked
    /// when they are decoded. `index` is the monitor's position in the
    /// manifest, for error messages.
    pub fn validate(&self, index: usize) -> Result<(), ManifestError> {
        if self.name.is_empty() || self.name.chars().count() > MAX_NAME_LEN {
            return Err(ManifestError::InvalidName { index });
        }
        let invalid = |field, reason: &str| ManifestError::InvalidField {
            monitor: self.name.clone(),
            field,
            reason: reason.to_string(),
        };
        let pulse = &self.pulse_check;
        if pulse.interval.is_zero() {
            return Err(invalid("pulse_check.interval", "must be greater than zero"));
        }
        if pulse.timeout.is_zero() {
            return Err(invalid("pulse_check.timeout", "must be greater than zero"));
        }
        if pulse.max_failures == 0 {
            return Err(invalid("pulse_check.max_failures", "must be at least 1"));
        }
        if pulse.healthy_threshold == 0 {
            return Err(invalid("pulse_check.healthy_threshold", "must be at least 1"));
        }
        if self.intervention.as_ref().is_some_and(|i| i.retries == 0) {
            return Err(invalid("intervention.retries", "must be at least 1"));
        }
        Ok(())
    }
}
