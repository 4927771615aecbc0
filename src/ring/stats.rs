use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::window::{SlidingWindow, DEFAULT_WINDOW};

/// Point-in-time view of a ring, as reported by `JobRing::stats`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct RingStats {
    pub kind: &'static str,
    pub depth: usize,
    /// `None` for the expandable ring.
    pub capacity: Option<usize>,
    pub enqueued_total: u64,
    pub dequeued_total: u64,
    /// Jobs discarded without being executed (fast shutdown, failed transfer).
    pub dropped_total: u64,
    /// Enqueue attempts refused with `Full`. Refused jobs stay with their monitor.
    pub rejected_total: u64,
    pub enqueue_rate: f64,
    pub dequeue_rate: f64,
    pub mean_wait_ms: f64,
    pub max_wait_ms: f64,
    pub closed: bool,
}

/// Counters shared by both ring implementations.
#[derive(Debug)]
pub(crate) struct RingCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    wait_total_us: AtomicU64,
    wait_max_us: AtomicU64,
    enqueue_window: SlidingWindow,
    dequeue_window: SlidingWindow,
}

impl RingCounters {
    pub(crate) fn new() -> Self {
        Self {
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            wait_total_us: AtomicU64::new(0),
            wait_max_us: AtomicU64::new(0),
            enqueue_window: SlidingWindow::new(DEFAULT_WINDOW),
            dequeue_window: SlidingWindow::new(DEFAULT_WINDOW),
        }
    }

    pub(crate) fn on_enqueue(&self, now: Instant, n: usize) {
        self.enqueued.fetch_add(n as u64, Ordering::Relaxed);
        self.enqueue_window.record(now, n as u64, 0);
    }

    pub(crate) fn on_dequeue(&self, now: Instant, waits: impl Iterator<Item = Duration>) {
        let mut n = 0u64;
        let mut total = 0u64;
        let mut max = 0u64;
        for wait in waits {
            let us = wait.as_micros().min(u64::MAX as u128) as u64;
            n += 1;
            total = total.saturating_add(us);
            max = max.max(us);
        }
        if n == 0 {
            return;
        }
        self.dequeued.fetch_add(n, Ordering::Relaxed);
        self.wait_total_us.fetch_add(total, Ordering::Relaxed);
        self.wait_max_us.fetch_max(max, Ordering::Relaxed);
        self.dequeue_window.record(now, n, total);
    }

    pub(crate) fn on_reject(&self, n: usize) {
        self.rejected.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_drop(&self, n: usize) {
        self.dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, kind: &'static str, depth: usize, capacity: Option<usize>, closed: bool) -> RingStats {
        let now = Instant::now();
        let dequeued = self.dequeued.load(Ordering::Relaxed);
        let wait_total = self.wait_total_us.load(Ordering::Relaxed);
        let mean_wait_us = if dequeued == 0 { 0.0 } else { wait_total as f64 / dequeued as f64 };
        RingStats {
            kind,
            depth,
            capacity,
            enqueued_total: self.enqueued.load(Ordering::Relaxed),
            dequeued_total: dequeued,
            dropped_total: self.dropped.load(Ordering::Relaxed),
            rejected_total: self.rejected.load(Ordering::Relaxed),
            enqueue_rate: self.enqueue_window.rate(now),
            dequeue_rate: self.dequeue_window.rate(now),
            mean_wait_ms: mean_wait_us / 1000.0,
            max_wait_ms: self.wait_max_us.load(Ordering::Relaxed) as f64 / 1000.0,
            closed,
        }
    }
}
