//! Periodic self-healing passes over the whole store.
use tokio::time::Instant;
use tracing::{error, warn};

use super::{Queues, World};
use crate::enums::Pipeline;
use crate::jobs::Job;
use crate::monitor::{Flags, MonitorRecord};

/// Resets monitors that have waited on a result longer than
/// `max_pending_age` back to `*_Needed`. Covers results lost to router
/// overflow. Returns how many (monitor, pipeline) pairs were reset.
pub fn sweep_pending(world: &mut World, now: Instant) -> usize {
    let max_age = world.config.max_pending_age;
    let World {
        store,
        queues,
        stats,
        ..
    } = world;
    let mut reset = 0;
    store.for_each(|record| {
        for pipeline in Pipeline::ALL {
            let Some(since) = record.pending_since[pipeline] else { continue };
            if !record.flags.contains(Flags::pending(pipeline)) {
                record.pending_since[pipeline] = None;
                continue;
            }
            if now.saturating_duration_since(since) < max_age {
                continue;
            }
            warn!(
                monitor = %record.name,
                pipeline = %pipeline,
                waited_secs = now.saturating_duration_since(since).as_secs(),
                "No result within the pending deadline, rescheduling."
            );
            return_to_needed(record, queues, pipeline, now);
            stats.swept[pipeline] += 1;
            reset += 1;
        }
    });
    reset
}

/// Puts the monitors of jobs that never reached a worker back to
/// `*_Needed`. Jobs from an earlier dispatch are skipped. Returns how many
/// monitors were requeued.
pub fn requeue_lost(world: &mut World, jobs: &[Job], now: Instant) -> usize {
    let World { store, queues, .. } = world;
    let mut requeued = 0;
    for job in jobs {
        let Some(record) = store.get_mut(job.monitor) else { continue };
        if !record.flags.contains(Flags::pending(job.pipeline)) || record.generation[job.pipeline] != job.generation {
            continue;
        }
        return_to_needed(record, queues, job.pipeline, now);
        requeued += 1;
    }
    requeued
}

/// Pending -> Needed. A code job gives its color back with the cooldown it
/// started cleared; the color only goes out again once it is releasable.
fn return_to_needed(record: &mut MonitorRecord, queues: &mut Queues, pipeline: Pipeline, now: Instant) {
    record.flags.remove(Flags::pending(pipeline));
    record.pending_since[pipeline] = None;
    if pipeline == Pipeline::Code {
        if let Some(color) = record.code_in_flight.take() {
            record.pending_codes.insert(color);
            record.code_state[color].not_before = None;
        }
        if record.releasable_code(now).is_none() {
            return;
        }
    }
    queues.mark_needed(record, pipeline);
}

/// Restores the flag invariants: Needed and Pending are never set together,
/// and a disabled monitor has no phase bits. Returns the number of repairs.
pub fn repair(world: &mut World) -> usize {
    let World {
        store,
        queues,
        stats,
        ..
    } = world;
    let mut repairs = 0;
    store.for_each(|record| {
        let flags = record.flags.load();
        if flags.contains(Flags::DISABLED) {
            if flags.intersects(Flags::all_phases()) {
                error!(monitor = %record.name, flags = ?flags, "Disabled monitor still has phase flags, clearing.");
                record.clear_phases();
                repairs += 1;
            }
            return;
        }
        for pipeline in Pipeline::ALL {
            let both = Flags::needed(pipeline) | Flags::pending(pipeline);
            if !flags.contains(both) {
                continue;
            }
            error!(
                monitor = %record.name,
                pipeline = %pipeline,
                flags = ?flags,
                "Monitor is both needed and pending, clearing pending."
            );
            record.flags.remove(Flags::pending(pipeline));
            record.pending_since[pipeline] = None;
            if pipeline == Pipeline::Code {
                if let Some(color) = record.code_in_flight.take() {
                    record.pending_codes.insert(color);
                }
            }
            queues.enqueue_ready(record, pipeline);
            repairs += 1;
        }
    });
    stats.repairs += repairs as u64;
    repairs
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::enums::Color;
    use crate::jobs::testing::noop;
    use crate::jobs::{FailureKind, JobResult, TaskOutput};
    use crate::monitor::MonitorId;
    use crate::ring::{JobRing, Ring, RingKind};
    use crate::systems::{SystemsConfig, dispatch, pulse};
    use std::time::Duration;

    #[test]
    fn sweep_reschedules_lost_pulses() {
        let mut world = world_with([record("a"), record("b")]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let t0 = Instant::now();
        pulse::schedule(&mut world, t0);
        dispatch(&mut world, Pipeline::Pulse, &ring, t0);
        ring.dequeue_batch(10);

        let age = SystemsConfig::default().max_pending_age;
        assert_eq!(sweep_pending(&mut world, t0 + age / 2), 0);
        assert_eq!(sweep_pending(&mut world, t0 + age), 2);
        assert_eq!(world.count_with(Flags::PULSE_NEEDED), 2);
        assert_eq!(world.stats().swept.pulse, 2);
        assert_eq!(dispatch(&mut world, Pipeline::Pulse, &ring, t0 + age), 2);
    }

    #[test]
    fn late_result_from_swept_dispatch_is_stale() {
        let mut world = world_with([record("a")]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let t0 = Instant::now();
        pulse::schedule(&mut world, t0);
        dispatch(&mut world, Pipeline::Pulse, &ring, t0);
        let first = ring.dequeue().unwrap();

        let later = t0 + world.config().max_pending_age;
        assert_eq!(sweep_pending(&mut world, later), 1);
        assert_eq!(dispatch(&mut world, Pipeline::Pulse, &ring, later), 1);
        let second = ring.dequeue().unwrap();
        assert_ne!(first.generation, second.generation);

        let late = JobResult::from_job(&first, TaskOutput::failed(FailureKind::Timeout, "hung"), Duration::ZERO);
        pulse::on_result(&mut world, &late, later);
        let rec = world.store().get(MonitorId(0)).unwrap();
        assert!(rec.flags.contains(Flags::PULSE_PENDING));
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(world.stats().stale_results.pulse, 1);

        let fresh = JobResult::from_job(&second, TaskOutput::ok(), Duration::ZERO);
        pulse::on_result(&mut world, &fresh, later);
        assert!(!flags(&world, 0).contains(Flags::PULSE_PENDING));
        assert_eq!(world.stats().stale_results.pulse, 1);
    }

    #[test]
    fn sweep_returns_lost_code_to_pending_colors() {
        let rec = record("a").with_code(Color::Red, code_route(Duration::from_secs(600), noop()));
        let mut world = world_with([rec]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let t0 = Instant::now();
        world.handoff(MonitorId(0), Color::Red, t0);
        dispatch(&mut world, Pipeline::Code, &ring, t0);
        ring.dequeue_batch(10);
        assert!(flags(&world, 0).contains(Flags::CODE_PENDING));

        let later = t0 + world.config().max_pending_age;
        assert_eq!(sweep_pending(&mut world, later), 1);
        let rec = world.store().get(MonitorId(0)).unwrap();
        assert!(rec.flags.contains(Flags::CODE_NEEDED));
        assert_eq!(rec.code_in_flight, None);
        assert!(rec.pending_codes.contains(Color::Red));
    }

    #[test]
    fn repair_clears_pending_when_both_set() {
        let mut world = world_with([record("a"), record("b")]);
        world
            .store()
            .get(MonitorId(0))
            .unwrap()
            .flags
            .insert(Flags::INTERVENTION_NEEDED | Flags::INTERVENTION_PENDING);
        world.store_mut().get_mut(MonitorId(1)).unwrap().flags.insert(Flags::DISABLED | Flags::PULSE_PENDING);

        assert_eq!(repair(&mut world), 2);
        assert_eq!(flags(&world, 0) & Flags::phase(Pipeline::Intervention), Flags::INTERVENTION_NEEDED);
        assert!(!flags(&world, 1).intersects(Flags::all_phases()));
        assert_eq!(world.ready_len(Pipeline::Intervention), 1);
        assert_eq!(repair(&mut world), 0);
        assert_eq!(world.stats().repairs, 2);
    }
}
