//! Alert policy: per-color cooldown with a recovery bypass.
//!
//! A handoff records the color as pending. Colors inside their cooldown
//! stay pending with `CodeNeeded` clear until [`schedule`] promotes them;
//! green is never held back. Only one code job per monitor is out at a
//! time, so at most one job per color is ever in flight.
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{CodeStats, Queues, World, pending_record};
use crate::enums::{Color, Pipeline};
use crate::jobs::{JobResult, Outcome};
use crate::monitor::MonitorRecord;

pub(crate) fn handoff(
    record: &mut MonitorRecord,
    queues: &mut Queues,
    stats: &mut CodeStats,
    color: Color,
    now: Instant,
) {
    if !record.codes[color].as_ref().is_some_and(|route| route.dispatch) {
        stats.silent += 1;
        debug!(monitor = %record.name, color = %color, "No dispatching route for color, recording only.");
        return;
    }
    if record.pending_codes.contains(color) || record.code_in_flight == Some(color) {
        stats.coalesced += 1;
        return;
    }

    if color == Color::Green {
        let stale: Vec<Color> = record
            .pending_codes
            .iter()
            .filter(|c| record.code_state[*c].is_cooling(now))
            .collect();
        for c in stale {
            record.pending_codes.remove(c);
            stats.superseded += 1;
            debug!(monitor = %record.name, color = %c, "Dropping held alert superseded by recovery.");
        }
    }

    record.pending_codes.insert(color);
    if color != Color::Green && record.code_state[color].is_cooling(now) {
        stats.suppressed += 1;
        if let Some(not_before) = record.code_state[color].not_before {
            queues.code_due.push(not_before, record.id);
        }
        debug!(monitor = %record.name, color = %color, "Alert held by cooldown.");
        return;
    }
    queues.mark_needed(record, Pipeline::Code);
}

/// Promotes held colors whose cooldown has elapsed.
pub fn schedule(world: &mut World, now: Instant) -> usize {
    let World { store, queues, .. } = world;
    let mut promoted = 0;
    while let Some(id) = queues.code_due.pop_due(now) {
        let Some(record) = store.get_mut(id) else { continue };
        if record.releasable_code(now).is_some() && queues.mark_needed(record, Pipeline::Code) {
            promoted += 1;
        }
    }
    promoted
}

/// Applies one notification result. A failure is counted, never retried:
/// the color waits for its next transition.
pub fn on_result(world: &mut World, result: &JobResult, now: Instant) {
    let warn_threshold = world.config.notif_failure_warn_threshold;
    let World {
        store,
        queues,
        stats,
        ..
    } = world;

    let in_flight = store.get(result.monitor).and_then(|r| r.code_in_flight);
    if result.color.is_none() || in_flight != result.color {
        stats.results[Pipeline::Code] += 1;
        stats.stale_results[Pipeline::Code] += 1;
        return;
    }
    let Some(record) = pending_record(store, stats, result, Pipeline::Code) else {
        return;
    };
    let Some(color) = record.code_in_flight.take() else {
        return;
    };

    let state = &mut record.code_state[color];
    match &result.outcome {
        Outcome::Ok => {
            state.last_success = Some(now);
            state.consecutive_notif_failures = 0;
            state.sent_total += 1;
            stats.codes.sent += 1;
            debug!(monitor = %record.name, color = %color, "Alert delivered.");
        }
        Outcome::Failed { kind, message } => {
            state.consecutive_notif_failures += 1;
            state.failed_total += 1;
            stats.codes.failed += 1;
            let streak = state.consecutive_notif_failures;
            if warn_threshold > 0 && streak >= warn_threshold {
                warn!(
                    monitor = %record.name,
                    color = %color,
                    consecutive_failures = streak,
                    kind = %kind,
                    "Alert delivery keeps failing: {}", message
                );
            } else {
                debug!(monitor = %record.name, color = %color, kind = %kind, "Alert delivery failed: {}", message);
            }
        }
    }

    if record.releasable_code(now).is_some() {
        queues.mark_needed(record, Pipeline::Code);
    }
}
