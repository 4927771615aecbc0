//! Job rings: the queues between the controller and each worker pool.
use arc_swap::{ArcSwap, Guard};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::jobs::Job;

pub mod bounded;
pub mod expandable;
pub mod stats;

pub use bounded::BoundedRing;
pub use expandable::ExpandableRing;
pub use stats::RingStats;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring is full")]
    Full,
    #[error("ring is closed")]
    Closed,
}

/// Contract shared by every ring implementation.
///
/// Enqueue stamps `enqueued_at`, dequeue stamps `started_at`. Nothing here
/// blocks: a full ring refuses, an empty ring returns nothing.
pub trait JobRing: Send + Sync {
    /// All-or-nothing. On success `jobs` is drained; on error it is untouched.
    fn enqueue_batch(&self, jobs: &mut Vec<Job>) -> Result<(), RingError>;

    /// Returns between 0 and `max` jobs.
    fn dequeue_batch(&self, max: usize) -> Vec<Job>;

    fn len(&self) -> usize;

    fn capacity(&self) -> Option<usize>;

    /// Further enqueues fail with `Closed`; dequeue keeps draining.
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Removes and drops every queued job, counting them as dropped.
    fn discard(&self) -> usize;

    fn record_dropped(&self, n: usize);

    fn stats(&self) -> RingStats;

    fn enqueue(&self, job: Job) -> Result<(), RingError> {
        let mut batch = vec![job];
        self.enqueue_batch(&mut batch)
    }

    fn dequeue(&self) -> Option<Job> {
        self.dequeue_batch(1).pop()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RingKind {
    Bounded,
    Expandable,
}

impl fmt::Display for RingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingKind::Bounded => f.write_str("bounded"),
            RingKind::Expandable => f.write_str("expandable"),
        }
    }
}

/// Either ring implementation behind one concrete type, so it can live in an `ArcSwap`.
#[derive(Debug)]
pub enum Ring {
    Bounded(BoundedRing),
    Expandable(ExpandableRing),
}

impl Ring {
    pub fn new(kind: RingKind, capacity: usize, soft_limit: Option<usize>) -> Self {
        match kind {
            RingKind::Bounded => Ring::Bounded(BoundedRing::new(capacity)),
            RingKind::Expandable => Ring::Expandable(ExpandableRing::with_soft_limit(soft_limit)),
        }
    }

    pub fn kind(&self) -> RingKind {
        match self {
            Ring::Bounded(_) => RingKind::Bounded,
            Ring::Expandable(_) => RingKind::Expandable,
        }
    }

    fn inner(&self) -> &dyn JobRing {
        match self {
            Ring::Bounded(r) => r,
            Ring::Expandable(r) => r,
        }
    }
}

impl JobRing for Ring {
    fn enqueue_batch(&self, jobs: &mut Vec<Job>) -> Result<(), RingError> {
        self.inner().enqueue_batch(jobs)
    }

    fn dequeue_batch(&self, max: usize) -> Vec<Job> {
        self.inner().dequeue_batch(max)
    }

    fn len(&self) -> usize {
        self.inner().len()
    }

    fn capacity(&self) -> Option<usize> {
        self.inner().capacity()
    }

    fn close(&self) {
        self.inner().close()
    }

    fn is_closed(&self) -> bool {
        self.inner().is_closed()
    }

    fn discard(&self) -> usize {
        self.inner().discard()
    }

    fn record_dropped(&self, n: usize) {
        self.inner().record_dropped(n)
    }

    fn stats(&self) -> RingStats {
        self.inner().stats()
    }
}

/// Handle through which both the controller (producer) and a pool (consumers)
/// reach the current ring. Swapping is atomic from every holder's view.
#[derive(Clone)]
pub struct SharedRing(Arc<ArcSwap<Ring>>);

impl SharedRing {
    pub fn new(ring: Ring) -> Self {
        Self(Arc::new(ArcSwap::from_pointee(ring)))
    }

    pub fn load(&self) -> Guard<Arc<Ring>> {
        self.0.load()
    }

    pub fn load_full(&self) -> Arc<Ring> {
        self.0.load_full()
    }

    /// Installs `ring` and returns the one it replaced.
    pub fn replace(&self, ring: Arc<Ring>) -> Arc<Ring> {
        self.0.swap(ring)
    }

    pub fn kind(&self) -> RingKind {
        self.load().kind()
    }
}

impl fmt::Debug for SharedRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedRing").field(&self.load().kind()).finish()
    }
}

/// Result of [`transfer`].
#[derive(Debug, Default)]
pub struct Transfer {
    pub moved: usize,
    /// Jobs the target ring would not take; already counted as dropped on the source.
    pub refused: Vec<Job>,
}

/// Moves every job from `from` into `to`, preserving order within each batch.
/// Jobs that `to` refuses are counted as dropped on `from` and handed back.
pub fn transfer(from: &dyn JobRing, to: &dyn JobRing) -> Transfer {
    let mut outcome = Transfer::default();
    loop {
        let mut batch = from.dequeue_batch(1024);
        if batch.is_empty() {
            break;
        }
        let n = batch.len();
        for job in &mut batch {
            job.started_at = None;
        }
        match to.enqueue_batch(&mut batch) {
            Ok(()) => outcome.moved += n,
            Err(_) => {
                from.record_dropped(n);
                outcome.refused.append(&mut batch);
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Pipeline;
    use crate::jobs::testing::noop;
    use crate::monitor::MonitorId;

    fn job(i: u32) -> Job {
        Job::new(MonitorId(i), Pipeline::Pulse, noop())
    }

    fn both() -> Vec<Ring> {
        vec![
            Ring::new(RingKind::Bounded, 64, None),
            Ring::new(RingKind::Expandable, 64, None),
        ]
    }

    #[test]
    fn fifo_round_trip_and_balanced_counters() {
        for ring in both() {
            for i in 0..40 {
                ring.enqueue(job(i)).unwrap();
            }
            let mut out = Vec::new();
            while let Some(job) = ring.dequeue() {
                out.push(job.monitor.0);
            }
            assert_eq!(out, (0..40).collect::<Vec<_>>(), "{:?}", ring.kind());
            let stats = ring.stats();
            assert_eq!(stats.enqueued_total, 40);
            assert_eq!(stats.dequeued_total, stats.enqueued_total);
            assert_eq!(stats.depth, 0);
        }
    }

    #[test]
    fn timestamps_are_stamped() {
        for ring in both() {
            ring.enqueue(job(1)).unwrap();
            let job = ring.dequeue().unwrap();
            assert!(job.enqueued_at.is_some());
            assert!(job.started_at.is_some());
            assert!(job.queue_wait().is_some());
        }
    }

    #[test]
    fn close_refuses_enqueue_but_drains() {
        for ring in both() {
            let mut batch: Vec<Job> = (0..3).map(job).collect();
            ring.enqueue_batch(&mut batch).unwrap();
            ring.close();
            assert_eq!(ring.enqueue(job(99)), Err(RingError::Closed));
            assert_eq!(ring.dequeue_batch(10).len(), 3);
            assert!(ring.dequeue().is_none());
            assert!(ring.stats().closed);
        }
    }

    #[test]
    fn dequeue_batch_respects_max() {
        for ring in both() {
            let mut batch: Vec<Job> = (0..10).map(job).collect();
            ring.enqueue_batch(&mut batch).unwrap();
            assert_eq!(ring.dequeue_batch(4).len(), 4);
            assert_eq!(ring.dequeue_batch(0).len(), 0);
            assert_eq!(ring.len(), 6);
        }
    }

    #[test]
    fn discard_counts_dropped() {
        for ring in both() {
            let mut batch: Vec<Job> = (0..5).map(job).collect();
            ring.enqueue_batch(&mut batch).unwrap();
            assert_eq!(ring.discard(), 5);
            assert_eq!(ring.stats().dropped_total, 5);
            assert!(ring.is_empty());
        }
    }

    #[test]
    fn shared_ring_swap_and_transfer() {
        let shared = SharedRing::new(Ring::new(RingKind::Bounded, 8, None));
        for i in 0..6 {
            shared.load().enqueue(job(i)).unwrap();
        }
        let next = Arc::new(Ring::new(RingKind::Expandable, 0, None));
        let old = shared.load_full();
        let outcome = transfer(old.as_ref(), next.as_ref());
        assert_eq!(outcome.moved, 6);
        assert!(outcome.refused.is_empty());
        let previous = shared.replace(next);
        assert_eq!(previous.kind(), RingKind::Bounded);
        assert_eq!(shared.kind(), RingKind::Expandable);
        let ids: Vec<u32> = shared.load().dequeue_batch(10).iter().map(|j| j.monitor.0).collect();
        assert_eq!(ids, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn transfer_into_smaller_ring_counts_drops() {
        let from = Ring::new(RingKind::Expandable, 0, None);
        let mut batch: Vec<Job> = (0..10).map(job).collect();
        from.enqueue_batch(&mut batch).unwrap();
        let to = Ring::new(RingKind::Bounded, 4, None);
        let outcome = transfer(&from, &to);
        assert_eq!(outcome.moved, 0);
        let refused: Vec<u32> = outcome.refused.iter().map(|j| j.monitor.0).collect();
        assert_eq!(refused, (0..10).collect::<Vec<_>>());
        assert_eq!(from.stats().dropped_total, 10);
    }
}
