use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::Instant;

use super::stats::{RingCounters, RingStats};
use super::{JobRing, RingError};
use crate::jobs::Job;

/// Unbounded ring built on linked segments.
///
/// Never reports `Full` unless a soft limit was derived from the process
/// memory cap, in which case it behaves like a very large bounded ring.
#[derive(Debug)]
pub struct ExpandableRing {
    queue: SegQueue<Job>,
    len: AtomicUsize,
    soft_limit: Option<usize>,
    closed: AtomicBool,
    counters: RingCounters,
}

impl ExpandableRing {
    pub fn new() -> Self {
        Self::with_soft_limit(None)
    }

    pub fn with_soft_limit(soft_limit: Option<usize>) -> Self {
        Self {
            queue: SegQueue::new(),
            len: AtomicUsize::new(0),
            soft_limit,
            closed: AtomicBool::new(false),
            counters: RingCounters::new(),
        }
    }

    pub fn soft_limit(&self) -> Option<usize> {
        self.soft_limit
    }
}

impl Default for ExpandableRing {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRing for ExpandableRing {
    fn enqueue_batch(&self, jobs: &mut Vec<Job>) -> Result<(), RingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RingError::Closed);
        }
        let n = jobs.len();
        if n == 0 {
            return Ok(());
        }
        if let Some(limit) = self.soft_limit {
            let reserved = self.len.fetch_add(n, Ordering::AcqRel);
            if reserved + n > limit {
                self.len.fetch_sub(n, Ordering::AcqRel);
                self.counters.on_reject(n);
                return Err(RingError::Full);
            }
        } else {
            self.len.fetch_add(n, Ordering::AcqRel);
        }
        let now = Instant::now();
        for mut job in jobs.drain(..) {
            job.enqueued_at = Some(now);
            self.queue.push(job);
        }
        self.counters.on_enqueue(now, n);
        Ok(())
    }

    fn dequeue_batch(&self, max: usize) -> Vec<Job> {
        let mut jobs = Vec::new();
        while jobs.len() < max {
            match self.queue.pop() {
                Some(job) => jobs.push(job),
                None => break,
            }
        }
        if !jobs.is_empty() {
            self.len.fetch_sub(jobs.len(), Ordering::AcqRel);
            let now = Instant::now();
            for job in &mut jobs {
                job.started_at = Some(now);
            }
            self.counters
                .on_dequeue(now, jobs.iter().filter_map(Job::queue_wait));
        }
        jobs
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn discard(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        self.len.fetch_sub(dropped, Ordering::AcqRel);
        self.counters.on_drop(dropped);
        dropped
    }

    fn record_dropped(&self, n: usize) {
        self.counters.on_drop(n);
    }

    fn stats(&self) -> RingStats {
        self.counters
            .snapshot("expandable", self.len(), None, self.is_closed())
    }
}
