//! Dynamically sized worker pool draining one pipeline's ring.
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::duration;
use crate::enums::Pipeline;
use crate::jobs::{FailureKind, JobResult, Outcome};
use crate::ring::{JobRing, Ring, SharedRing};
use crate::window::{SlidingWindow, WindowSnapshot, DEFAULT_WINDOW};

mod worker;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// W*: the queueing delay the sizing model aims for.
    #[serde(with = "duration::serde_str")]
    pub target_latency: Duration,
    /// Largest change in worker count per `tune` call.
    pub slew_step: usize,
    pub result_batch: usize,
    #[serde(with = "duration::serde_str")]
    pub flush_interval: Duration,
    pub dequeue_batch: usize,
    #[serde(with = "duration::serde_str")]
    pub idle_backoff_min: Duration,
    #[serde(with = "duration::serde_str")]
    pub idle_backoff_max: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 5,
            max_workers: 120_000,
            target_latency: Duration::from_millis(100),
            slew_step: 64,
            result_batch: 1000,
            flush_interval: Duration::from_millis(10),
            dequeue_batch: 16,
            idle_backoff_min: Duration::from_millis(1),
            idle_backoff_max: Duration::from_millis(20),
        }
    }
}

impl PoolConfig {
    pub fn clamp(&self, workers: usize) -> usize {
        workers.clamp(self.min_workers, self.max_workers.max(self.min_workers))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopMode {
    /// Execute everything still queued before stopping.
    #[default]
    Graceful,
    /// Drop queued jobs; only in-flight jobs complete.
    Fast,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pipeline: Pipeline,
    pub desired_workers: usize,
    pub running_workers: usize,
    pub busy_workers: usize,
    pub paused: bool,
    pub executed_total: u64,
    pub failed_total: u64,
    pub panicked_total: u64,
    pub completion_rate: f64,
    pub mean_service_ms: Option<f64>,
    pub service_cv: Option<f64>,
}

pub(crate) struct PoolShared {
    pipeline: Pipeline,
    config: PoolConfig,
    ring: SharedRing,
    results_tx: mpsc::Sender<Vec<JobResult>>,
    desired: AtomicUsize,
    running: AtomicUsize,
    busy: AtomicUsize,
    paused: AtomicBool,
    draining: AtomicBool,
    stop_now: AtomicBool,
    executed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    /// Service time per completed job, in micros.
    service: SlidingWindow,
}

impl PoolShared {
    /// Atomically claims one retirement slot when more workers run than desired.
    fn try_retire(&self) -> bool {
        let mut running = self.running.load(Ordering::Acquire);
        loop {
            if running <= self.desired.load(Ordering::Acquire) {
                return false;
            }
            match self.running.compare_exchange_weak(
                running,
                running - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => running = actual,
            }
        }
    }

    fn record_execution(&self, result: &JobResult) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if let Outcome::Failed { kind, .. } = &result.outcome {
            self.failed.fetch_add(1, Ordering::Relaxed);
            if *kind == FailureKind::ExecutorError {
                self.panicked.fetch_add(1, Ordering::Relaxed);
            }
        }
        let micros = result.duration.as_micros().min(u64::MAX as u128) as u64;
        self.service.record(Instant::now(), 1, micros.max(1));
    }
}

/// Pool of tokio tasks executing jobs from one ring.
///
/// Scaling is cooperative: `desired` is a target and surplus workers retire
/// themselves between batches, so a scale-down never interrupts a job.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    tasks: Mutex<JoinSet<()>>,
    next_worker_id: AtomicUsize,
}

impl WorkerPool {
    /// Spawns `min_workers` workers on the current runtime.
    pub fn start(
        pipeline: Pipeline,
        ring: SharedRing,
        results_tx: mpsc::Sender<Vec<JobResult>>,
        config: PoolConfig,
    ) -> Arc<Self> {
        let initial = config.clamp(config.min_workers);
        let pool = Arc::new(Self {
            shared: Arc::new(PoolShared {
                pipeline,
                config,
                ring,
                results_tx,
                desired: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                paused: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                stop_now: AtomicBool::new(false),
                executed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                panicked: AtomicU64::new(0),
                service: SlidingWindow::new(DEFAULT_WINDOW),
            }),
            tasks: Mutex::new(JoinSet::new()),
            next_worker_id: AtomicUsize::new(0),
        });
        pool.scale_to(initial);
        info!(pipeline = %pipeline, workers = initial, "Worker pool started.");
        pool
    }

    pub fn pipeline(&self) -> Pipeline {
        self.shared.pipeline
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn desired_workers(&self) -> usize {
        self.shared.desired.load(Ordering::Acquire)
    }

    pub fn running_workers(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Sets the target and spawns any missing workers. Surplus workers retire on their own.
    fn scale_to(&self, target: usize) {
        self.shared.desired.store(target, Ordering::Release);
        let mut tasks = self.tasks.lock();
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                warn!(pipeline = %self.shared.pipeline, "Worker task ended abnormally: {}", e);
            }
        }
        loop {
            let running = self.shared.running.load(Ordering::Acquire);
            if running >= target {
                break;
            }
            if self
                .shared
                .running
                .compare_exchange(running, running + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
            tasks.spawn(worker::run(Arc::clone(&self.shared), id));
        }
    }

    /// Moves the worker target toward `target`, clamped to [min, max] and by at
    /// most `slew_step`. Returns the new target.
    pub fn tune(&self, target: usize) -> usize {
        if self.shared.draining.load(Ordering::Acquire) {
            return self.desired_workers();
        }
        let cfg = &self.shared.config;
        let goal = cfg.clamp(target);
        let current = self.desired_workers();
        let step = cfg.slew_step.max(1);
        let next = if goal > current {
            current + (goal - current).min(step)
        } else {
            current - (current - goal).min(step)
        };
        if next != current {
            debug!(
                pipeline = %self.shared.pipeline,
                from = current,
                to = next,
                goal,
                "Tuning worker pool."
            );
            self.scale_to(next);
        }
        next
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Swaps the ring workers read from. Returns the previous ring.
    pub fn replace_ring(&self, ring: Arc<Ring>) -> Arc<Ring> {
        self.shared.ring.replace(ring)
    }

    /// Refuses new work and waits for workers to finish.
    ///
    /// The caller closes the ring first. In `Graceful` mode workers drain the
    /// closed ring; in `Fast` mode queued jobs are discarded. Each worker
    /// flushes its pending results before exiting. Returns false on timeout.
    pub async fn drain_and_stop(&self, mode: StopMode, timeout: Duration) -> bool {
        let ring = self.shared.ring.load_full();
        ring.close();
        self.shared.draining.store(true, Ordering::Release);
        self.shared.paused.store(false, Ordering::Release);
        if mode == StopMode::Fast {
            self.shared.stop_now.store(true, Ordering::Release);
            let dropped = ring.discard();
            if dropped > 0 {
                info!(pipeline = %self.shared.pipeline, dropped, "Discarded queued jobs on fast stop.");
            }
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        let joined = tokio::time::timeout(timeout, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    warn!(pipeline = %self.shared.pipeline, "Worker task ended abnormally: {}", e);
                }
            }
        })
        .await;

        match joined {
            Ok(()) => {
                info!(pipeline = %self.shared.pipeline, "Worker pool stopped.");
                true
            }
            Err(_) => {
                warn!(
                    pipeline = %self.shared.pipeline,
                    remaining = tasks.len(),
                    "Worker pool did not stop in time, aborting remaining workers."
                );
                tasks.abort_all();
                false
            }
        }
    }

    pub fn service_window(&self) -> WindowSnapshot {
        self.shared.service.snapshot(Instant::now())
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.shared;
        let service = self.service_window();
        PoolStats {
            pipeline: s.pipeline,
            desired_workers: s.desired.load(Ordering::Acquire),
            running_workers: s.running.load(Ordering::Acquire),
            busy_workers: s.busy.load(Ordering::Acquire),
            paused: s.paused.load(Ordering::Acquire),
            executed_total: s.executed.load(Ordering::Relaxed),
            failed_total: s.failed.load(Ordering::Relaxed),
            panicked_total: s.panicked.load(Ordering::Relaxed),
            completion_rate: service.rate(),
            mean_service_ms: service.mean().map(|us| us / 1000.0),
            service_cv: service.coefficient_of_variation(),
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pipeline", &self.shared.pipeline)
            .field("desired", &self.desired_workers())
            .field("running", &self.running_workers())
            .finish()
    }
}
