use tokio::time::Instant;
use tracing::{info, warn};

use super::pulse::open_incident;
use super::{World, code, pending_record};
use crate::enums::{Color, Pipeline};
use crate::jobs::{JobResult, Outcome};

/// Applies one remediation result.
///
/// Success opens a verification window and raises yellow. Failure retries
/// until `max_failures` attempts have failed, then escalates to red.
pub fn on_result(world: &mut World, result: &JobResult, now: Instant) {
    let World {
        store,
        queues,
        stats,
        ..
    } = world;
    let Some(record) = pending_record(store, stats, result, Pipeline::Intervention) else {
        return;
    };
    let max_failures = record
        .intervention
        .as_ref()
        .map_or(1, |route| route.max_failures.max(1));

    match &result.outcome {
        Outcome::Ok => {
            info!(monitor = %record.name, "Intervention succeeded, verifying recovery.");
            record.intervention_failures = 0;
            open_incident(record);
            code::handoff(record, queues, &mut stats.codes, Color::Yellow, now);
        }
        Outcome::Failed { kind, message } => {
            record.intervention_failures += 1;
            record.intervention_failures_total += 1;
            if record.intervention_failures >= max_failures {
                warn!(
                    monitor = %record.name,
                    attempts = record.intervention_failures,
                    kind = %kind,
                    "Intervention exhausted, escalating to red: {}", message
                );
                record.intervention_failures = 0;
                open_incident(record);
                code::handoff(record, queues, &mut stats.codes, Color::Red, now);
            } else {
                info!(
                    monitor = %record.name,
                    attempt = record.intervention_failures,
                    max_failures,
                    kind = %kind,
                    "Intervention failed, retrying: {}", message
                );
                queues.mark_needed(record, Pipeline::Intervention);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::jobs::testing::noop;
    use crate::jobs::{FailureKind, Job, TaskOutput};
    use crate::monitor::{Flags, MonitorId};
    use crate::ring::{JobRing, Ring, RingKind};
    use std::time::Duration;

    fn result(world: &World, ok: bool) -> JobResult {
        let job = current(world, Job::new(MonitorId(0), Pipeline::Intervention, noop()));
        let output = if ok {
            TaskOutput::ok()
        } else {
            TaskOutput::failed(FailureKind::Action, "exit status 1")
        };
        JobResult::from_job(&job, output, Duration::from_millis(30))
    }

    fn report(world: &mut World, ok: bool, now: Instant) {
        let outcome = result(world, ok);
        on_result(world, &outcome, now);
    }

    fn armed_world(max_failures: u32) -> (World, Ring) {
        let mut rec = record("db")
            .with_intervention(intervention(max_failures, noop()))
            .with_code(Color::Red, code_route(Duration::from_secs(60), noop()))
            .with_code(Color::Yellow, code_route(Duration::from_secs(60), noop()));
        rec.pulse.healthy_threshold = 2;
        let mut world = world_with([rec]);
        let ring = Ring::new(RingKind::Expandable, 0, None);
        let now = Instant::now();
        if let Some(rec) = world.store.get_mut(MonitorId(0)) {
            world.queues.mark_needed(rec, Pipeline::Intervention);
        }
        crate::systems::dispatch(&mut world, Pipeline::Intervention, &ring, now);
        ring.dequeue_batch(10);
        (world, ring)
    }

    #[test]
    fn success_raises_yellow_and_opens_incident() {
        let (mut world, _ring) = armed_world(1);
        report(&mut world, true, Instant::now());
        let rec = world.store().get(MonitorId(0)).unwrap();
        assert!(rec.is_incident_open());
        assert_eq!(rec.verify_remaining, 2);
        assert!(rec.pending_codes.contains(Color::Yellow));
        assert!(rec.flags.contains(Flags::CODE_NEEDED));
        assert!(!rec.flags.intersects(Flags::phase(Pipeline::Intervention)));
    }

    #[test]
    fn failures_retry_then_escalate_to_red() {
        let (mut world, ring) = armed_world(3);
        let now = Instant::now();
        for attempt in 1..3 {
            report(&mut world, false, now);
            assert!(flags(&world, 0).contains(Flags::INTERVENTION_NEEDED), "attempt {attempt}");
            crate::systems::dispatch(&mut world, Pipeline::Intervention, &ring, now);
            ring.dequeue_batch(10);
        }
        report(&mut world, false, now);
        let rec = world.store().get(MonitorId(0)).unwrap();
        assert!(rec.is_incident_open());
        assert!(rec.pending_codes.contains(Color::Red));
        assert_eq!(rec.intervention_failures, 0);
        assert_eq!(rec.intervention_failures_total, 3);
        assert!(!rec.flags.intersects(Flags::phase(Pipeline::Intervention)));
    }
}
