//! Runtime choice between the bounded and the expandable ring.
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Controller, Lane};
use crate::enums::Pipeline;
use crate::ring::{JobRing, Ring, RingKind, Transfer, transfer};
use crate::systems::recovery;

/// Fleets at or above `threshold` monitors get the expandable ring.
pub(crate) fn desired_kind(monitors: usize, threshold: usize) -> RingKind {
    if monitors >= threshold {
        RingKind::Expandable
    } else {
        RingKind::Bounded
    }
}

/// Replaces the lane's ring with a fresh one of `kind`.
///
/// Workers are paused for the duration so nothing is dequeued from the old
/// ring while its contents move. The controller is the only producer and is
/// busy here, so no job can land in the old ring after the swap. Jobs the new
/// ring refuses come back in the [`Transfer`].
fn switch_lane(lane: &mut Lane, kind: RingKind) -> Transfer {
    lane.pool.pause();
    let next = Arc::new(Ring::new(kind, lane.capacity, lane.soft_limit));
    let old = lane.ring.load_full();
    let outcome = transfer(old.as_ref(), next.as_ref());
    let previous = lane.pool.replace_ring(next);
    previous.close();
    lane.pool.resume();
    outcome
}

impl Controller {
    /// Moves every pipeline to the ring kind that suits the current fleet size.
    pub(crate) fn evaluate_rings(&mut self, now: Instant) {
        let want = desired_kind(self.world.store().count(), self.config.ring_switch_threshold);
        for pipeline in Pipeline::ALL {
            let lane = &mut self.lanes[pipeline];
            let current = lane.ring.kind();
            if current == want {
                continue;
            }
            let depth = lane.ring.load().len();
            if want == RingKind::Bounded && depth > lane.capacity {
                debug!(
                    pipeline = %pipeline,
                    depth,
                    capacity = lane.capacity,
                    "Deferring switch to bounded ring until the backlog drains."
                );
                continue;
            }
            let outcome = switch_lane(lane, want);
            if !outcome.refused.is_empty() {
                let requeued = recovery::requeue_lost(&mut self.world, &outcome.refused, now);
                warn!(
                    pipeline = %pipeline,
                    dropped = outcome.refused.len(),
                    requeued,
                    "New ring refused queued jobs, monitors scheduled again."
                );
            }
            info!(
                pipeline = %pipeline,
                from = %current,
                to = %want,
                moved = outcome.moved,
                "Switched job ring."
            );
        }
    }
}
