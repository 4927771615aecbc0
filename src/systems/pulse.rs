use tokio::time::Instant;
use tracing::{debug, info};

use super::{Queues, SystemStats, World, code, pending_record};
use crate::enums::{Color, Pipeline};
use crate::jobs::{JobResult, Outcome};
use crate::monitor::{Flags, MonitorRecord};

/// Marks every monitor whose check is due as `PulseNeeded`.
///
/// Due times live in a min-heap, so the pass costs O(due) rather than
/// O(fleet). A popped entry is re-checked against the record: monitors
/// that are disabled, already active, or rescheduled later are skipped.
pub fn schedule(world: &mut World, now: Instant) -> usize {
    let World { store, queues, .. } = world;
    let mut marked = 0;
    while let Some(id) = queues.pulse_due.pop_due(now) {
        let Some(record) = store.get_mut(id) else { continue };
        if record.is_disabled() || record.flags.intersects(Flags::phase(Pipeline::Pulse)) {
            continue;
        }
        let first = record.flags.contains(Flags::PULSE_FIRST_CHECK);
        if !first && record.next_check.is_some_and(|next| now < next) {
            continue;
        }
        if queues.mark_needed(record, Pipeline::Pulse) {
            marked += 1;
        }
    }
    marked
}

/// Applies one pulse result. Results for monitors that are not
/// `PulsePending` are counted as stale and ignored.
pub fn on_result(world: &mut World, result: &JobResult, now: Instant) {
    let World {
        store,
        queues,
        stats,
        ..
    } = world;
    let Some(record) = pending_record(store, stats, result, Pipeline::Pulse) else {
        return;
    };

    record.last_check = Some(now);
    match &result.outcome {
        Outcome::Ok => on_success(record, queues, stats, now),
        Outcome::Failed { kind, message } => {
            debug!(
                monitor = %record.name,
                kind = %kind,
                consecutive = record.consecutive_failures + 1,
                "Pulse failed: {}", message
            );
            on_failure(record, queues, stats, now);
        }
    }

    let next = now + record.pulse.interval;
    record.next_check = Some(next);
    queues.pulse_due.push(next, record.id);
}

fn on_success(record: &mut MonitorRecord, queues: &mut Queues, stats: &mut SystemStats, now: Instant) {
    record.last_success = Some(now);
    record.consecutive_failures = 0;
    if !record.is_incident_open() {
        return;
    }
    record.verify_remaining = record.verify_remaining.saturating_sub(1);
    record.recovery_streak += 1;
    if record.verify_remaining > 0 {
        record.flags.insert(Flags::VERIFYING);
        return;
    }
    record.flags.remove(Flags::INCIDENT_OPEN | Flags::VERIFYING);
    record.recovery_streak = 0;
    record.intervention_failures = 0;
    info!(monitor = %record.name, "Monitor recovered.");
    code::handoff(record, queues, &mut stats.codes, Color::Green, now);
}

fn on_failure(record: &mut MonitorRecord, queues: &mut Queues, stats: &mut SystemStats, now: Instant) {
    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
    record.pulse_failures_total += 1;

    if record.is_incident_open() {
        // Still down: the recovery count starts over.
        record.verify_remaining = record.pulse.healthy_threshold.max(1);
        record.recovery_streak = 0;
        record.flags.remove(Flags::VERIFYING);
        return;
    }
    if record.consecutive_failures != record.pulse.unhealthy_threshold {
        return;
    }

    if record.intervention.is_some() {
        if queues.mark_needed(record, Pipeline::Intervention) {
            info!(
                monitor = %record.name,
                failures = record.consecutive_failures,
                "Unhealthy threshold reached, requesting intervention."
            );
        }
    } else {
        info!(
            monitor = %record.name,
            failures = record.consecutive_failures,
            "Unhealthy threshold reached, raising red alert."
        );
        open_incident(record);
        code::handoff(record, queues, &mut stats.codes, Color::Red, now);
    }
}

/// Marks the monitor as in an incident that needs H successes to close.
pub(crate) fn open_incident(record: &mut MonitorRecord) {
    record.flags.insert(Flags::INCIDENT_OPEN);
    record.flags.remove(Flags::VERIFYING);
    record.verify_remaining = record.pulse.healthy_threshold.max(1);
    record.recovery_streak = 0;
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::jobs::testing::noop;
    use crate::jobs::{FailureKind, Job, TaskOutput};
    use crate::monitor::MonitorId;
    use crate::ring::{JobRing, Ring, RingKind};
    use std::time::Duration;

    fn pulse_result(world: &World, id: u32, ok: bool) -> JobResult {
        let job = current(world, Job::new(MonitorId(id), Pipeline::Pulse, noop()));
        let output = if ok {
            TaskOutput::ok()
        } else {
            TaskOutput::failed(FailureKind::Timeout, "deadline elapsed")
        };
        JobResult::from_job(&job, output, Duration::from_millis(5))
    }

    fn report(world: &mut World, id: u32, ok: bool, now: Instant) {
        let result = pulse_result(world, id, ok);
        on_result(world, &result, now);
    }

    /// Schedules and dispatches one pulse for every due monitor.
    fn cycle(world: &mut World, ring: &Ring, now: Instant) {
        schedule(world, now);
        super::super::dispatch(world, Pipeline::Pulse, ring, now);
        ring.dequeue_batch(usize::MAX);
    }

    #[test]
    fn first_check_is_due_immediately_then_waits_interval() {
        let mut world = world_with([record("a")]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let t0 = Instant::now();
        cycle(&mut world, &ring, t0);
        assert!(flags(&world, 0).contains(Flags::PULSE_PENDING));
        assert!(!flags(&world, 0).contains(Flags::PULSE_FIRST_CHECK));

        report(&mut world, 0, true, t0);
        let rec = world.store().get(MonitorId(0)).unwrap();
        assert_eq!(rec.next_check, Some(t0 + Duration::from_secs(1)));
        assert!(rec.flags.load().is_empty());

        assert_eq!(schedule(&mut world, t0 + Duration::from_millis(500)), 0);
        assert_eq!(schedule(&mut world, t0 + Duration::from_secs(1)), 1);
    }

    #[test]
    fn reaching_threshold_without_intervention_raises_red_once() {
        let task = crate::jobs::testing::ScriptedTask::always(true);
        let mut rec = record("a").with_code(Color::Red, code_route(Duration::ZERO, task.clone()));
        rec.pulse.unhealthy_threshold = 3;
        let mut world = world_with([rec]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let mut now = Instant::now();

        for _ in 0..5 {
            cycle(&mut world, &ring, now);
            report(&mut world, 0, false, now);
            now += Duration::from_secs(1);
        }
        let rec = world.store().get(MonitorId(0)).unwrap();
        assert_eq!(rec.consecutive_failures, 5);
        assert!(rec.is_incident_open());
        assert!(rec.flags.contains(Flags::CODE_NEEDED));
        assert!(rec.pending_codes.contains(Color::Red));
        assert_eq!(world.stats().codes.coalesced, 0);
    }

    #[test]
    fn threshold_with_intervention_requests_it() {
        let rec = record("a").with_intervention(intervention(1, noop()));
        let mut world = world_with([rec]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let now = Instant::now();
        cycle(&mut world, &ring, now);
        report(&mut world, 0, false, now);
        let f = flags(&world, 0);
        assert!(f.contains(Flags::INTERVENTION_NEEDED));
        assert!(!f.contains(Flags::INCIDENT_OPEN));
        assert_eq!(world.ready_len(Pipeline::Intervention), 1);
    }

    #[test]
    fn recovery_needs_healthy_threshold_successes() {
        let mut rec = record("a");
        rec.pulse.healthy_threshold = 2;
        let mut world = world_with([rec]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let mut now = Instant::now();

        let step = |world: &mut World, ok: bool, now: &mut Instant| {
            cycle(world, &ring, *now);
            report(world, 0, ok, *now);
            *now += Duration::from_secs(1);
        };

        step(&mut world, false, &mut now);
        assert!(flags(&world, 0).contains(Flags::INCIDENT_OPEN));
        step(&mut world, true, &mut now);
        assert!(flags(&world, 0).contains(Flags::VERIFYING));
        // A failure while verifying restarts the count.
        step(&mut world, false, &mut now);
        assert_eq!(world.store().get(MonitorId(0)).unwrap().verify_remaining, 2);
        step(&mut world, true, &mut now);
        step(&mut world, true, &mut now);
        let rec = world.store().get(MonitorId(0)).unwrap();
        assert!(!rec.is_incident_open());
        assert_eq!(rec.consecutive_failures, 0);
        assert!(!rec.flags.contains(Flags::VERIFYING));
    }

    #[test]
    fn success_never_moves_next_check_backwards() {
        let mut world = world_with([record("a")]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let mut now = Instant::now();
        let mut previous = None;
        for i in 0..4 {
            cycle(&mut world, &ring, now);
            report(&mut world, 0, i % 2 == 0, now);
            let rec = world.store().get(MonitorId(0)).unwrap();
            assert!(rec.next_check >= previous);
            previous = rec.next_check;
            now += Duration::from_secs(1);
        }
    }

    #[test]
    fn result_without_pending_is_stale() {
        let mut world = world_with([record("a")]);
        report(&mut world, 0, false, Instant::now());
        report(&mut world, 42, false, Instant::now());
        let rec = world.store().get(MonitorId(0)).unwrap();
        assert_eq!(rec.consecutive_failures, 0);
        assert_eq!(world.stats().stale_results.pulse, 2);
    }
}
