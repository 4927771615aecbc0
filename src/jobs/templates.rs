//! Per-monitor task templates. Every job a monitor ever produces shares one
//! of these, so dispatch never allocates configuration.
use std::sync::Arc;

use super::Task;
use crate::enums::{Color, ColorMap};
use crate::interventions::ActionTask;
use crate::manifest::{ManifestError, MonitorSpec};
use crate::notifications::NotifyTask;
use crate::probes::ProbeTask;

#[derive(Debug)]
pub struct Templates {
    pub pulse: Arc<dyn Task>,
    pub intervention: Option<Arc<dyn Task>>,
    pub codes: ColorMap<Option<Arc<dyn Task>>>,
}

/// Decodes the kind-specific sections of `spec` and builds its tasks.
pub fn build_templates(spec: &MonitorSpec) -> Result<Templates, ManifestError> {
    let name: Arc<str> = Arc::from(spec.name.as_str());
    let pulse = &spec.pulse_check;

    let probe = ProbeTask::new(spec.probe_config()?, pulse.timeout, pulse.retries);
    let intervention = spec
        .action_config()?
        .map(|config| Arc::new(ActionTask::new(spec.name.clone(), config)) as Arc<dyn Task>);

    let mut codes: ColorMap<Option<Arc<dyn Task>>> = ColorMap::default();
    for color in Color::ALL {
        if let Some(channel) = spec.channel_config(color)? {
            codes[color] = Some(Arc::new(NotifyTask::new(Arc::clone(&name), color, channel)));
        }
    }

    Ok(Templates {
        pulse: Arc::new(probe),
        intervention,
        codes,
    })
}
