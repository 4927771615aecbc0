use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::flags::{Flags, StateFlags};
use super::MonitorId;
use crate::enums::{ActionKind, Color, ColorMap, ColorSet, NotifyKind, Pipeline, Pipelines, PulseKind};
use crate::jobs::Task;

#[derive(Debug, Clone)]
pub struct PulseSettings {
    pub kind: PulseKind,
    pub interval: Duration,
    pub timeout: Duration,
    pub retries: u32,
    /// U: consecutive failures that open an incident.
    pub unhealthy_threshold: u32,
    /// H: consecutive successes that close one.
    pub healthy_threshold: u32,
}

impl PulseSettings {
    pub fn new(kind: PulseKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            timeout: interval,
            retries: 0,
            unhealthy_threshold: 1,
            healthy_threshold: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InterventionRoute {
    pub action: ActionKind,
    /// M: failed attempts before escalating to red.
    pub max_failures: u32,
    pub task: Arc<dyn Task>,
}

#[derive(Debug, Clone)]
pub struct CodeRoute {
    pub notify: NotifyKind,
    /// `false` keeps the color silent: transitions are recorded but nothing is sent.
    pub dispatch: bool,
    pub cooldown: Duration,
    pub task: Arc<dyn Task>,
}

/// Runtime alert bookkeeping for one color.
#[derive(Debug, Clone, Default)]
pub struct CodeState {
    pub not_before: Option<Instant>,
    pub last_success: Option<Instant>,
    pub consecutive_notif_failures: u32,
    pub sent_total: u64,
    pub failed_total: u64,
}

impl CodeState {
    pub fn is_cooling(&self, now: Instant) -> bool {
        self.not_before.is_some_and(|nb| now < nb)
    }
}

/// Consolidated per-monitor state. Mutated only by the controller thread.
#[derive(Debug)]
pub struct MonitorRecord {
    pub id: MonitorId,
    pub name: Arc<str>,
    pub pulse: PulseSettings,
    pub pulse_task: Arc<dyn Task>,
    pub intervention: Option<InterventionRoute>,
    pub codes: ColorMap<Option<CodeRoute>>,
    pub flags: StateFlags,

    pub last_check: Option<Instant>,
    pub last_success: Option<Instant>,
    pub next_check: Option<Instant>,

    pub consecutive_failures: u32,
    pub recovery_streak: u32,
    pub pulse_failures_total: u64,
    pub intervention_failures: u32,
    pub intervention_failures_total: u64,
    pub verify_remaining: u32,

    pub code_state: ColorMap<CodeState>,
    /// Colors handed off but not yet dispatched.
    pub pending_codes: ColorSet,
    /// The color whose job is currently out with a worker.
    pub code_in_flight: Option<Color>,
    /// When each pipeline last went Pending; drives the stuck-pending sweep.
    pub pending_since: Pipelines<Option<Instant>>,
    /// Accepted dispatches per pipeline. A result only counts if its job
    /// carries the current value.
    pub generation: Pipelines<u32>,
    /// Whether the id currently sits in a pipeline's ready queue.
    pub(crate) queued: Pipelines<bool>,
}

impl MonitorRecord {
    pub fn new(name: impl Into<Arc<str>>, pulse: PulseSettings, pulse_task: Arc<dyn Task>) -> Self {
        Self {
            id: MonitorId::UNASSIGNED,
            name: name.into(),
            pulse,
            pulse_task,
            intervention: None,
            codes: ColorMap::default(),
            flags: StateFlags::new(Flags::PULSE_FIRST_CHECK),
            last_check: None,
            last_success: None,
            next_check: None,
            consecutive_failures: 0,
            recovery_streak: 0,
            pulse_failures_total: 0,
            intervention_failures: 0,
            intervention_failures_total: 0,
            verify_remaining: 0,
            code_state: ColorMap::default(),
            pending_codes: ColorSet::default(),
            code_in_flight: None,
            pending_since: Pipelines::default(),
            generation: Pipelines::default(),
            queued: Pipelines::default(),
        }
    }

    pub fn with_intervention(mut self, route: InterventionRoute) -> Self {
        self.intervention = Some(route);
        self
    }

    pub fn with_code(mut self, color: Color, route: CodeRoute) -> Self {
        self.codes[color] = Some(route);
        self
    }

    pub fn disabled(self) -> Self {
        self.flags.insert(Flags::DISABLED);
        self
    }

    pub fn is_disabled(&self) -> bool {
        self.flags.contains(Flags::DISABLED)
    }

    pub fn is_incident_open(&self) -> bool {
        self.flags.contains(Flags::INCIDENT_OPEN)
    }

    /// True if the pipeline has neither Needed nor Pending set.
    pub fn is_idle(&self, pipeline: Pipeline) -> bool {
        !self.flags.intersects(Flags::phase(pipeline))
    }

    /// Next code color that may be sent now, in priority order.
    pub fn releasable_code(&self, now: Instant) -> Option<Color> {
        self.pending_codes
            .iter()
            .find(|color| *color == Color::Green || !self.code_state[*color].is_cooling(now))
    }

    /// Wipe every scheduling bit and queued alert; the record keeps its counters.
    pub fn clear_phases(&mut self) {
        self.flags.remove(Flags::all_phases());
        self.pending_codes.clear();
        self.code_in_flight = None;
        self.pending_since = Pipelines::default();
    }
}
