//! The per-tick state machine: schedule, dispatch and result systems.
//!
//! Everything here runs on the controller task and only touches the
//! [`World`]. Rings are the sole output; result channels the sole input.
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::enums::{Color, Pipeline, Pipelines};
use crate::jobs::{Job, JobResult};
use crate::monitor::{Flags, MonitorId, MonitorRecord, MonitorStore, StoreError};
use crate::ring::{JobRing, RingError};

pub mod code;
pub mod intervention;
pub mod pulse;
pub mod recovery;

#[derive(Debug, Clone)]
pub struct SystemsConfig {
    /// B_dispatch: most jobs one dispatch pass may enqueue.
    pub dispatch_batch: usize,
    /// Jobs per `enqueue_batch` call; halved after each `Full`.
    pub dispatch_chunk: usize,
    /// Most results one result pass may drain.
    pub result_batch: usize,
    pub max_pending_age: Duration,
    pub notif_failure_warn_threshold: u32,
}

impl Default for SystemsConfig {
    fn default() -> Self {
        Self {
            dispatch_batch: 10_000,
            dispatch_chunk: 1024,
            result_batch: 10_000,
            max_pending_age: Duration::from_secs(300),
            notif_failure_warn_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct CodeStats {
    /// Handoffs held back by a color's cooldown.
    pub suppressed: u64,
    /// Handoffs for a color that was already queued or in flight.
    pub coalesced: u64,
    /// Cooling colors dropped because a recovery arrived first.
    pub superseded: u64,
    /// Handoffs for colors that are unrouted or have `dispatch: false`.
    pub silent: u64,
    pub sent: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SystemStats {
    pub dispatched: Pipelines<u64>,
    /// Jobs refused by a full ring; their monitors kept `*_Needed`.
    pub rejected: Pipelines<u64>,
    /// Jobs refused by a closed ring.
    pub refused_closed: Pipelines<u64>,
    pub results: Pipelines<u64>,
    /// Results for monitors that were no longer pending on that pipeline.
    pub stale_results: Pipelines<u64>,
    /// Monitors reset by the pending-age sweep.
    pub swept: Pipelines<u64>,
    pub repairs: u64,
    pub codes: CodeStats,
}

/// Min-heap of (due time, monitor). Entries are hints: whoever pops one
/// re-checks the record before acting on it.
#[derive(Debug, Default)]
pub struct DueQueue {
    heap: BinaryHeap<Reverse<(Instant, MonitorId)>>,
}

impl DueQueue {
    pub fn push(&mut self, due: Instant, id: MonitorId) {
        self.heap.push(Reverse((due, id)));
    }

    /// Pops the next entry whose time has come.
    pub fn pop_due(&mut self, now: Instant) -> Option<MonitorId> {
        match self.heap.peek() {
            Some(Reverse((due, _))) if *due <= now => self.heap.pop().map(|Reverse((_, id))| id),
            _ => None,
        }
    }

    pub fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

/// Scheduling structures that sit beside the store.
#[derive(Debug, Default)]
pub(crate) struct Queues {
    ready: Pipelines<VecDeque<MonitorId>>,
    pulse_due: DueQueue,
    code_due: DueQueue,
}

impl Queues {
    /// Sets `*_Needed` unless the pipeline is already active or the monitor
    /// is disabled, and queues the id for dispatch. Returns whether the flag was set.
    pub(crate) fn mark_needed(&mut self, record: &mut MonitorRecord, pipeline: Pipeline) -> bool {
        if record.is_disabled() || record.flags.intersects(Flags::phase(pipeline)) {
            return false;
        }
        record.flags.insert(Flags::needed(pipeline));
        self.enqueue_ready(record, pipeline);
        true
    }

    fn enqueue_ready(&mut self, record: &mut MonitorRecord, pipeline: Pipeline) {
        if !record.queued[pipeline] {
            record.queued[pipeline] = true;
            self.ready[pipeline].push_back(record.id);
        }
    }
}

/// Monitor store plus everything the systems need to walk it incrementally.
#[derive(Debug)]
pub struct World {
    store: MonitorStore,
    queues: Queues,
    stats: SystemStats,
    config: SystemsConfig,
}

impl World {
    pub fn new(config: SystemsConfig) -> Self {
        Self::with_store(MonitorStore::new(), config)
    }

    pub fn with_store(store: MonitorStore, config: SystemsConfig) -> Self {
        let mut world = Self {
            store: MonitorStore::new(),
            queues: Queues::default(),
            stats: SystemStats::default(),
            config,
        };
        let now = Instant::now();
        for record in store.iter() {
            if !record.is_disabled() {
                world.queues.pulse_due.push(now, record.id);
            }
        }
        world.store = store;
        world
    }

    /// Adds a monitor; enabled monitors get their first check on the next schedule pass.
    pub fn insert(&mut self, record: MonitorRecord, now: Instant) -> Result<MonitorId, StoreError> {
        let disabled = record.is_disabled();
        let id = self.store.insert(record)?;
        if !disabled {
            self.queues.pulse_due.push(now, id);
        }
        Ok(id)
    }

    /// Enables or disables a monitor. Disabling clears its phase flags
    /// immediately; in-flight results for it are then ignored as stale.
    pub fn set_enabled(&mut self, id: MonitorId, enabled: bool, now: Instant) -> Option<bool> {
        let was_disabled = self.store.set_disabled(id, !enabled)?;
        if enabled && was_disabled {
            let due = self
                .store
                .get(id)
                .and_then(|r| r.next_check)
                .map_or(now, |next| next.max(now));
            self.queues.pulse_due.push(due, id);
            debug!(monitor = %id, "Monitor enabled.");
        } else if !enabled && !was_disabled {
            debug!(monitor = %id, "Monitor disabled.");
        }
        Some(!was_disabled)
    }

    pub fn store(&self) -> &MonitorStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MonitorStore {
        &mut self.store
    }

    pub fn stats(&self) -> &SystemStats {
        &self.stats
    }

    pub fn config(&self) -> &SystemsConfig {
        &self.config
    }

    pub fn ready_len(&self, pipeline: Pipeline) -> usize {
        self.queues.ready[pipeline].len()
    }

    /// Number of monitors whose flag word contains all of `flags`.
    pub fn count_with(&self, flags: Flags) -> usize {
        self.store.iter().filter(|r| r.flags.contains(flags)).count()
    }

    /// Hands a color to the alert policy on behalf of `id`.
    pub fn handoff(&mut self, id: MonitorId, color: Color, now: Instant) {
        if let Some(record) = self.store.get_mut(id) {
            code::handoff(record, &mut self.queues, &mut self.stats.codes, color, now);
        }
    }
}

/// Record lookup for result handlers. Counts the result, and returns `None`
/// (counted as stale) when the monitor is no longer waiting on `pipeline`
/// or the result belongs to an earlier dispatch.
fn pending_record<'a>(
    store: &'a mut MonitorStore,
    stats: &mut SystemStats,
    result: &JobResult,
    pipeline: Pipeline,
) -> Option<&'a mut MonitorRecord> {
    stats.results[pipeline] += 1;
    let id = result.monitor;
    match store.get_mut(id) {
        Some(record)
            if record.flags.contains(Flags::pending(pipeline)) && record.generation[pipeline] == result.generation =>
        {
            record.flags.remove(Flags::pending(pipeline));
            record.pending_since[pipeline] = None;
            Some(record)
        }
        _ => {
            stats.stale_results[pipeline] += 1;
            trace!(monitor = %id, pipeline = %pipeline, "Ignoring stale result.");
            None
        }
    }
}

/// Builds the job for one queued monitor, or `None` if there is nothing to send.
fn build_job(record: &MonitorRecord, pipeline: Pipeline, now: Instant) -> Option<Job> {
    let generation = record.generation[pipeline].wrapping_add(1);
    let job = match pipeline {
        Pipeline::Pulse => Some(Job::new(record.id, pipeline, record.pulse_task.clone())),
        Pipeline::Intervention => record
            .intervention
            .as_ref()
            .map(|route| Job::new(record.id, pipeline, route.task.clone())),
        Pipeline::Code => {
            let color = record.releasable_code(now)?;
            let route = record.codes[color].as_ref()?;
            Some(Job::code(record.id, color, route.task.clone()))
        }
    };
    job.map(|job| job.with_generation(generation))
}

/// Needed -> Pending for a monitor whose job the ring accepted.
fn accept(record: &mut MonitorRecord, pipeline: Pipeline, color: Option<Color>, now: Instant) {
    record
        .flags
        .transition(Flags::needed(pipeline), Flags::pending(pipeline));
    record.pending_since[pipeline] = Some(now);
    record.generation[pipeline] = record.generation[pipeline].wrapping_add(1);
    match pipeline {
        Pipeline::Pulse => record.flags.remove(Flags::PULSE_FIRST_CHECK),
        Pipeline::Intervention => {}
        Pipeline::Code => {
            if let Some(color) = color {
                record.pending_codes.remove(color);
                record.code_in_flight = Some(color);
                if let Some(route) = record.codes[color].as_ref() {
                    record.code_state[color].not_before = Some(now + route.cooldown);
                }
            }
        }
    }
}

/// Moves up to `dispatch_batch` ready monitors into `ring`.
///
/// `*_Needed` is only cleared for monitors whose chunk the ring accepted;
/// refused ids go back to the front of the ready queue in their original
/// order. Returns the number of jobs enqueued.
pub fn dispatch(world: &mut World, pipeline: Pipeline, ring: &dyn JobRing, now: Instant) -> usize {
    let World {
        store,
        queues,
        stats,
        config,
    } = world;
    let ready = &mut queues.ready[pipeline];
    let needed = Flags::needed(pipeline);
    let mut chunk_size = config
        .dispatch_chunk
        .min(ring.capacity().unwrap_or(usize::MAX))
        .max(1);
    let mut dispatched = 0;

    while dispatched < config.dispatch_batch && !ready.is_empty() {
        let want = chunk_size.min(config.dispatch_batch - dispatched);
        let mut claimed: Vec<(MonitorId, Option<Color>)> = Vec::with_capacity(want);
        let mut jobs = Vec::with_capacity(want);
        while claimed.len() < want {
            let Some(id) = ready.pop_front() else { break };
            let Some(record) = store.get_mut(id) else { continue };
            record.queued[pipeline] = false;
            if record.is_disabled() || !record.flags.contains(needed) {
                continue;
            }
            match build_job(record, pipeline, now) {
                Some(job) => {
                    record.queued[pipeline] = true;
                    claimed.push((id, job.color));
                    jobs.push(job);
                }
                None => {
                    // Nothing releasable yet; the due queue re-arms it.
                    record.flags.remove(needed);
                }
            }
        }
        if jobs.is_empty() {
            break;
        }

        let n = jobs.len();
        match ring.enqueue_batch(&mut jobs) {
            Ok(()) => {
                let ids: Vec<MonitorId> = claimed.iter().map(|(id, _)| *id).collect();
                // `batch_apply` visits ids in order, so the claim list is walked alongside.
                let mut claims = claimed.iter();
                store.batch_apply(&ids, |record| {
                    let color = claims.find(|(id, _)| *id == record.id).and_then(|(_, color)| *color);
                    record.queued[pipeline] = false;
                    accept(record, pipeline, color, now);
                });
                dispatched += n;
                stats.dispatched[pipeline] += n as u64;
            }
            Err(err) => {
                for (id, _) in claimed.iter().rev() {
                    ready.push_front(*id);
                }
                match err {
                    RingError::Full => {
                        stats.rejected[pipeline] += n as u64;
                        if chunk_size == 1 {
                            break;
                        }
                        chunk_size /= 2;
                    }
                    RingError::Closed => {
                        stats.refused_closed[pipeline] += n as u64;
                        break;
                    }
                }
            }
        }
    }

    if dispatched > 0 {
        trace!(pipeline = %pipeline, dispatched, backlog = ready.len(), "Dispatched jobs.");
    }
    dispatched
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::ring::{Ring, RingKind};

    #[test]
    fn due_queue_pops_in_time_order() {
        let now = Instant::now();
        let mut q = DueQueue::default();
        q.push(now + Duration::from_secs(2), MonitorId(1));
        q.push(now, MonitorId(2));
        q.push(now + Duration::from_secs(1), MonitorId(3));
        assert_eq!(q.pop_due(now), Some(MonitorId(2)));
        assert_eq!(q.pop_due(now), None);
        assert_eq!(q.next_due(), Some(now + Duration::from_secs(1)));
        assert_eq!(q.pop_due(now + Duration::from_secs(5)), Some(MonitorId(3)));
        assert_eq!(q.pop_due(now + Duration::from_secs(5)), Some(MonitorId(1)));
        assert!(q.is_empty());
    }

    #[test]
    fn full_ring_keeps_monitors_needed() {
        let mut world = world_with((0..10_000).map(|i| record(&format!("m{i}"))));
        let ring = Ring::new(RingKind::Bounded, 1024, None);
        let now = Instant::now();

        pulse::schedule(&mut world, now);
        assert_eq!(world.ready_len(Pipeline::Pulse), 10_000);
        let sent = dispatch(&mut world, Pipeline::Pulse, &ring, now);

        assert_eq!(sent, 1024);
        assert_eq!(world.count_with(Flags::PULSE_PENDING), 1024);
        assert_eq!(world.count_with(Flags::PULSE_NEEDED), 10_000 - 1024);
        assert_eq!(world.count_with(Flags::PULSE_NEEDED | Flags::PULSE_PENDING), 0);
        assert_eq!(ring.len(), 1024);
        let ring_stats = ring.stats();
        assert_eq!(ring_stats.dropped_total, 0);
        assert!(ring_stats.rejected_total > 0);
        assert!(world.stats().rejected.pulse > 0);

        // Every pending monitor has exactly one job in the ring.
        let mut queued: Vec<u32> = ring.dequeue_batch(500).iter().map(|j| j.monitor.0).collect();
        let sent = dispatch(&mut world, Pipeline::Pulse, &ring, now);
        assert_eq!(sent, 500);
        queued.extend(ring.dequeue_batch(2048).iter().map(|j| j.monitor.0));
        queued.sort_unstable();
        queued.dedup();
        assert_eq!(queued.len(), 1524);
        assert_eq!(world.count_with(Flags::PULSE_PENDING), 1524);
    }

    #[test]
    fn dispatch_respects_batch_budget_and_order() {
        let mut world = world_with((0..50).map(|i| record(&format!("m{i}"))));
        world.config.dispatch_batch = 20;
        world.config.dispatch_chunk = 8;
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let now = Instant::now();
        pulse::schedule(&mut world, now);
        assert_eq!(dispatch(&mut world, Pipeline::Pulse, &ring, now), 20);
        let ids: Vec<u32> = ring.dequeue_batch(100).iter().map(|j| j.monitor.0).collect();
        assert_eq!(ids, (0..20).collect::<Vec<_>>());
        assert_eq!(world.ready_len(Pipeline::Pulse), 30);
    }

    #[test]
    fn closed_ring_refuses_without_state_change() {
        let mut world = world_with([record("a"), record("b")]);
        let ring = Ring::new(RingKind::Bounded, 16, None);
        ring.close();
        let now = Instant::now();
        pulse::schedule(&mut world, now);
        assert_eq!(dispatch(&mut world, Pipeline::Pulse, &ring, now), 0);
        assert_eq!(world.count_with(Flags::PULSE_NEEDED), 2);
        assert_eq!(world.stats().refused_closed.pulse, 2);
        assert_eq!(world.ready_len(Pipeline::Pulse), 2);
    }

    #[test]
    fn disabled_monitor_is_skipped_and_cleared() {
        let mut world = world_with([record("a"), record("b")]);
        let ring = Ring::new(RingKind::Bounded, 16, None);
        let now = Instant::now();
        pulse::schedule(&mut world, now);
        world.set_enabled(MonitorId(1), false, now);
        assert!(!flags(&world, 1).intersects(Flags::all_phases()));
        assert_eq!(dispatch(&mut world, Pipeline::Pulse, &ring, now), 1);
        assert_eq!(ring.dequeue().unwrap().monitor, MonitorId(0));

        // Re-enabling schedules it again without duplicating the queue entry.
        world.set_enabled(MonitorId(1), true, now);
        pulse::schedule(&mut world, now);
        assert_eq!(dispatch(&mut world, Pipeline::Pulse, &ring, now), 1);
        assert_eq!(ring.len(), 1);
    }
}
