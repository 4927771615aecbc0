//! Single-threaded driver of the state machine.
//!
//! The controller owns the [`World`] and is its only mutator. Each tick runs
//! the systems in a fixed order; sizing, self-healing and ring selection run
//! on slower cadences inside the same tick.
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::duration;
use crate::enums::{Pipeline, Pipelines};
use crate::jobs::JobResult;
use crate::monitor::{Flags, MonitorId, MonitorRecord, StoreError};
use crate::pool::{PoolConfig, PoolStats, StopMode, WorkerPool};
use crate::ring::{JobRing, Ring, RingKind, RingStats, SharedRing};
use crate::router::{DEFAULT_RESULT_BUFFER, ResultChannels, ResultRouter, RouterSnapshot, RouterStats};
use crate::sizing::{Observation, SizingConfig, SizingModel};
use crate::systems::{self, SystemStats, SystemsConfig, World, code, intervention, pulse, recovery};

mod switch;

#[cfg(test)]
mod scenarios;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_rate_hz: u32,
    pub dispatch_batch: usize,
    pub dispatch_chunk: usize,
    pub result_batch: usize,
    #[serde(with = "duration::serde_str")]
    pub sizing_interval: Duration,
    #[serde(with = "duration::serde_str")]
    pub queue_switch_interval: Duration,
    /// Monitor count at which the pipelines move to expandable rings.
    pub ring_switch_threshold: usize,
    #[serde(with = "duration::serde_str")]
    pub max_pending_age: Duration,
    pub notif_failure_warn_threshold: u32,
    pub shutdown_mode: StopMode,
    #[serde(with = "duration::serde_str")]
    pub drain_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 100,
            dispatch_batch: 10_000,
            dispatch_chunk: 1024,
            result_batch: 10_000,
            sizing_interval: Duration::from_secs(5),
            queue_switch_interval: Duration::from_secs(30),
            ring_switch_threshold: 100_000,
            max_pending_age: Duration::from_secs(300),
            notif_failure_warn_threshold: 3,
            shutdown_mode: StopMode::Graceful,
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    pub fn systems(&self) -> SystemsConfig {
        SystemsConfig {
            dispatch_batch: self.dispatch_batch.max(1),
            dispatch_chunk: self.dispatch_chunk.max(1),
            result_batch: self.result_batch.max(1),
            max_pending_age: self.max_pending_age,
            notif_failure_warn_threshold: self.notif_failure_warn_threshold,
        }
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate_hz.max(1)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RingsConfig {
    /// Bounded-ring capacity per pipeline, rounded up to a power of two.
    pub capacity: Pipelines<usize>,
    /// Expandable-ring job cap derived from the memory limit.
    #[serde(skip)]
    pub soft_limit: Option<usize>,
}

impl Default for RingsConfig {
    fn default() -> Self {
        Self {
            capacity: Pipelines {
                pulse: 65_536,
                intervention: 4096,
                code: 16_384,
            },
            soft_limit: None,
        }
    }
}

/// Everything besides the world that a controller needs to start.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub controller: ControllerConfig,
    pub rings: RingsConfig,
    pub pools: Pipelines<PoolConfig>,
    pub router_buffer: usize,
    pub sizing: SizingConfig,
    /// Expected arrival rate per pipeline before traffic is observed.
    pub seeded_rates: Pipelines<f64>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            controller: ControllerConfig::default(),
            rings: RingsConfig::default(),
            pools: Pipelines::default(),
            router_buffer: DEFAULT_RESULT_BUFFER,
            sizing: SizingConfig::default(),
            seeded_rates: Pipelines::default(),
        }
    }
}

/// Ring and pool serving one pipeline.
struct Lane {
    ring: SharedRing,
    pool: Arc<WorkerPool>,
    capacity: usize,
    soft_limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct PhaseCounts {
    pub needed: usize,
    pub pending: usize,
}

/// Point-in-time view published every sizing interval for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub taken_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub ticks: u64,
    pub monitors: usize,
    pub disabled: usize,
    pub incidents_open: usize,
    pub phases: Pipelines<PhaseCounts>,
    pub ready_backlog: Pipelines<usize>,
    pub systems: SystemStats,
    pub rings: Pipelines<RingStats>,
    pub pools: Vec<PoolStats>,
    pub worker_targets: Pipelines<usize>,
    pub router: RouterSnapshot,
}

impl Default for ControllerSnapshot {
    fn default() -> Self {
        Self {
            taken_at: Utc::now(),
            uptime_secs: 0,
            ticks: 0,
            monitors: 0,
            disabled: 0,
            incidents_open: 0,
            phases: Pipelines::default(),
            ready_backlog: Pipelines::default(),
            systems: SystemStats::default(),
            rings: Pipelines::default(),
            pools: Vec::new(),
            worker_targets: Pipelines::default(),
            router: RouterSnapshot::default(),
        }
    }
}

pub type SnapshotHandle = Arc<ArcSwap<ControllerSnapshot>>;

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub mode: StopMode,
    pub ticks: u64,
    /// Jobs discarded from rings without running.
    pub dropped: Pipelines<u64>,
    /// Results applied after the pools stopped.
    pub late_results: usize,
    /// False if any pool missed the drain deadline.
    pub clean: bool,
}

pub struct Controller {
    world: World,
    config: ControllerConfig,
    lanes: Pipelines<Lane>,
    results: ResultChannels,
    router: ResultRouter,
    router_stats: Arc<RouterStats>,
    sizing: SizingModel,
    seeded_rates: Pipelines<f64>,
    worker_targets: Pipelines<usize>,
    snapshot: SnapshotHandle,
    started: Instant,
    last_sizing: Instant,
    last_switch_check: Instant,
    ticks: u64,
}

impl Controller {
    /// Builds rings, pools and the router around `world`. Must be called
    /// from inside a tokio runtime.
    pub fn start(world: World, settings: ControllerSettings) -> Self {
        let ControllerSettings {
            controller: config,
            rings,
            pools,
            router_buffer,
            sizing,
            seeded_rates,
        } = settings;

        let kind = switch::desired_kind(world.store().count(), config.ring_switch_threshold);
        let (router, results) = ResultRouter::spawn(router_buffer);
        let router_stats = router.stats();
        let lanes = Pipelines::from_fn(|p| {
            let capacity = rings.capacity[p];
            let ring = SharedRing::new(Ring::new(kind, capacity, rings.soft_limit));
            let pool = WorkerPool::start(p, ring.clone(), router.sender(), pools[p].clone());
            Lane {
                ring,
                pool,
                capacity,
                soft_limit: rings.soft_limit,
            }
        });
        let worker_targets = lanes.map(|_, lane| lane.pool.desired_workers());
        let now = Instant::now();
        info!(
            monitors = world.store().count(),
            ring = %kind,
            tick_rate_hz = config.tick_rate_hz,
            "Controller started."
        );

        Self {
            world,
            config,
            lanes,
            results,
            router,
            router_stats,
            sizing: SizingModel::new(sizing),
            seeded_rates,
            worker_targets,
            snapshot: Arc::new(ArcSwap::from_pointee(ControllerSnapshot::default())),
            started: now,
            last_sizing: now,
            last_switch_check: now,
            ticks: 0,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn snapshots(&self) -> SnapshotHandle {
        Arc::clone(&self.snapshot)
    }

    pub fn ring_kind(&self, pipeline: Pipeline) -> RingKind {
        self.lanes[pipeline].ring.kind()
    }

    pub fn ring_stats(&self, pipeline: Pipeline) -> RingStats {
        self.lanes[pipeline].ring.load().stats()
    }

    pub fn pool(&self, pipeline: Pipeline) -> &Arc<WorkerPool> {
        &self.lanes[pipeline].pool
    }

    pub fn insert(&mut self, record: MonitorRecord) -> Result<MonitorId, StoreError> {
        self.world.insert(record, Instant::now())
    }

    /// Enables or disables a monitor by name. Returns false if it does not exist.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let Some(id) = self.world.store().find(name) else {
            return false;
        };
        self.world.set_enabled(id, enabled, Instant::now()).is_some()
    }

    /// One pass of every system, in order.
    pub fn tick(&mut self, now: Instant) {
        self.ticks += 1;

        pulse::schedule(&mut self.world, now);
        self.dispatch(Pipeline::Pulse, now);
        self.dispatch(Pipeline::Intervention, now);
        code::schedule(&mut self.world, now);
        self.dispatch(Pipeline::Code, now);

        for pipeline in Pipeline::ALL {
            self.drain_results(pipeline, now);
        }

        if now.saturating_duration_since(self.last_sizing) >= self.config.sizing_interval {
            self.last_sizing = now;
            self.resize();
            recovery::sweep_pending(&mut self.world, now);
            recovery::repair(&mut self.world);
            self.publish(now);
        }
        if now.saturating_duration_since(self.last_switch_check) >= self.config.queue_switch_interval {
            self.last_switch_check = now;
            self.evaluate_rings(now);
        }
    }

    fn dispatch(&mut self, pipeline: Pipeline, now: Instant) -> usize {
        let ring = self.lanes[pipeline].ring.load();
        systems::dispatch(&mut self.world, pipeline, &**ring, now)
    }

    fn drain_results(&mut self, pipeline: Pipeline, now: Instant) -> usize {
        let cap = self.world.config().result_batch;
        let rx = self.results.get_mut(pipeline);
        let mut applied = 0;
        while applied < cap {
            match rx.try_recv() {
                Ok(result) => {
                    apply_result(&mut self.world, &result, now);
                    applied += 1;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!(pipeline = %pipeline, "Result channel disconnected.");
                    break;
                }
            }
        }
        applied
    }

    /// Recomputes worker targets from observed traffic and applies them.
    fn resize(&mut self) {
        for pipeline in Pipeline::ALL {
            let lane = &self.lanes[pipeline];
            let pool_cfg = lane.pool.config();
            let obs = Observation {
                arrival_rate: lane.ring.load().stats().enqueue_rate,
                seeded_rate: self.seeded_rates[pipeline],
                service: lane.pool.service_window(),
            };
            let target = match self.sizing.target(&obs, pool_cfg.target_latency, pool_cfg.max_workers) {
                Ok(c) => c,
                Err(e) => {
                    warn!(pipeline = %pipeline, "Sizing failed, falling back to max workers: {}", e);
                    pool_cfg.max_workers
                }
            };
            let applied = lane.pool.tune(target);
            if applied != self.worker_targets[pipeline] {
                debug!(
                    pipeline = %pipeline,
                    target,
                    applied,
                    arrival_rate = obs.arrival_rate,
                    "Resized worker pool."
                );
            }
            self.worker_targets[pipeline] = applied;
        }
    }

    fn publish(&self, now: Instant) {
        let mut phases: Pipelines<PhaseCounts> = Pipelines::default();
        let mut disabled = 0;
        let mut incidents_open = 0;
        for record in self.world.store().iter() {
            let flags = record.flags.load();
            if flags.contains(Flags::DISABLED) {
                disabled += 1;
            }
            if flags.contains(Flags::INCIDENT_OPEN) {
                incidents_open += 1;
            }
            for p in Pipeline::ALL {
                if flags.contains(Flags::needed(p)) {
                    phases[p].needed += 1;
                }
                if flags.contains(Flags::pending(p)) {
                    phases[p].pending += 1;
                }
            }
        }
        let snapshot = ControllerSnapshot {
            taken_at: Utc::now(),
            uptime_secs: now.saturating_duration_since(self.started).as_secs(),
            ticks: self.ticks,
            monitors: self.world.store().count(),
            disabled,
            incidents_open,
            phases,
            ready_backlog: Pipelines::from_fn(|p| self.world.ready_len(p)),
            systems: self.world.stats().clone(),
            rings: self.lanes.map(|_, lane| lane.ring.load().stats()),
            pools: Pipeline::ALL.iter().map(|p| self.lanes[*p].pool.stats()).collect(),
            worker_targets: self.worker_targets.clone(),
            router: self.router_stats.snapshot(),
        };
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Ticks at the configured rate until `shutdown` fires, then stops the
    /// pipelines in the configured mode.
    pub async fn run(mut self, shutdown: CancellationToken) -> ShutdownReport {
        let mut ticker = tokio::time::interval(self.config.tick_period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = self.config.tick_period().as_millis() as u64, "Controller loop running.");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping controller loop.");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick(Instant::now());
                }
            }
        }
        let mode = self.config.shutdown_mode;
        self.shutdown(mode).await
    }

    /// Stop ticking, close rings, drain pools, close result channels, flush stats.
    pub async fn shutdown(self, mode: StopMode) -> ShutdownReport {
        info!(mode = ?mode, "Stopping pipelines.");
        self.publish(Instant::now());
        for lane in self.lanes.iter().map(|(_, lane)| lane) {
            lane.ring.load().close();
        }

        let timeout = self.config.drain_timeout;
        let stops = Pipeline::ALL.map(|p| {
            let pool = Arc::clone(&self.lanes[p].pool);
            async move { pool.drain_and_stop(mode, timeout).await }
        });
        let clean = futures::future::join_all(stops).await.into_iter().all(|ok| ok);
        if !clean {
            error!("At least one worker pool missed the drain deadline.");
        }

        let dropped = self.lanes.map(|_, lane| lane.ring.load().stats().dropped_total);
        let Self {
            mut world,
            lanes,
            mut results,
            router,
            router_stats,
            ticks,
            ..
        } = self;
        drop(lanes);
        if tokio::time::timeout(timeout, router.join()).await.is_err() {
            warn!("Result router did not finish in time.");
        }

        let now = Instant::now();
        let mut late_results = 0;
        for pipeline in Pipeline::ALL {
            let rx = results.get_mut(pipeline);
            rx.close();
            while let Ok(result) = rx.try_recv() {
                apply_result(&mut world, &result, now);
                late_results += 1;
            }
        }

        let stats = world.stats();
        info!(
            ticks,
            dispatched = ?stats.dispatched,
            stale_results = ?stats.stale_results,
            router_dropped = ?router_stats.snapshot().dropped,
            ring_dropped = ?dropped,
            late_results,
            "Controller stopped."
        );
        ShutdownReport {
            mode,
            ticks,
            dropped,
            late_results,
            clean,
        }
    }
}

fn apply_result(world: &mut World, result: &JobResult, now: Instant) {
    match result.pipeline {
        Pipeline::Pulse => pulse::on_result(world, result, now),
        Pipeline::Intervention => intervention::on_result(world, result, now),
        Pipeline::Code => code::on_result(world, result, now),
    }
}
