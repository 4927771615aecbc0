//! Lock-free sliding windows of per-second buckets.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Bucket {
    /// Second index + 1 that this bucket currently holds; 0 means empty.
    epoch: AtomicU64,
    count: AtomicU64,
    sum: AtomicU64,
    sum_sq: AtomicU64,
}

/// Aggregate over the buckets still inside the window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WindowSnapshot {
    pub count: u64,
    pub sum: u64,
    pub sum_sq: u64,
    pub span: Duration,
}

impl WindowSnapshot {
    /// Events per second over the covered span.
    pub fn rate(&self) -> f64 {
        let secs = self.span.as_secs_f64();
        if secs <= 0.0 { 0.0 } else { self.count as f64 / secs }
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum as f64 / self.count as f64)
    }

    /// Coefficient of variation (σ/mean) of the recorded values.
    pub fn coefficient_of_variation(&self) -> Option<f64> {
        if self.count < 2 {
            return None;
        }
        let n = self.count as f64;
        let mean = self.sum as f64 / n;
        if mean <= 0.0 {
            return None;
        }
        let variance = (self.sum_sq as f64 / n - mean * mean).max(0.0);
        Some(variance.sqrt() / mean)
    }
}

/// Counts events (and optionally a value per event) over the last `span` seconds.
///
/// A bucket that still carries an older second is reset by whichever writer
/// first claims it; a racing writer may lose a handful of samples, which is
/// acceptable for rate estimation.
pub struct SlidingWindow {
    origin: Instant,
    span_secs: u64,
    buckets: Box<[Bucket]>,
}

impl SlidingWindow {
    pub fn new(span: Duration) -> Self {
        Self::starting_at(span, Instant::now())
    }

    pub fn starting_at(span: Duration, origin: Instant) -> Self {
        let span_secs = span.as_secs().max(1);
        let buckets = (0..=span_secs).map(|_| Bucket::default()).collect();
        Self {
            origin,
            span_secs,
            buckets,
        }
    }

    fn second(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.origin).as_secs()
    }

    /// Records `count` events and a value total for them (e.g. micros of wait).
    pub fn record(&self, now: Instant, count: u64, value: u64) {
        if count == 0 {
            return;
        }
        let sec = self.second(now);
        let bucket = &self.buckets[(sec % self.buckets.len() as u64) as usize];
        let epoch = sec + 1;
        let seen = bucket.epoch.load(Ordering::Acquire);
        if seen != epoch
            && bucket
                .epoch
                .compare_exchange(seen, epoch, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            bucket.count.store(0, Ordering::Release);
            bucket.sum.store(0, Ordering::Release);
            bucket.sum_sq.store(0, Ordering::Release);
        }
        bucket.count.fetch_add(count, Ordering::AcqRel);
        bucket.sum.fetch_add(value, Ordering::AcqRel);
        let per_event = value / count;
        bucket
            .sum_sq
            .fetch_add(per_event.saturating_mul(per_event).saturating_mul(count), Ordering::AcqRel);
    }

    pub fn snapshot(&self, now: Instant) -> WindowSnapshot {
        let current = self.second(now);
        let oldest = current.saturating_sub(self.span_secs - 1);
        let mut snap = WindowSnapshot::default();
        for bucket in self.buckets.iter() {
            let epoch = bucket.epoch.load(Ordering::Acquire);
            if epoch == 0 {
                continue;
            }
            let sec = epoch - 1;
            if sec < oldest || sec > current {
                continue;
            }
            snap.count += bucket.count.load(Ordering::Acquire);
            snap.sum += bucket.sum.load(Ordering::Acquire);
            snap.sum_sq = snap.sum_sq.saturating_add(bucket.sum_sq.load(Ordering::Acquire));
        }
        let elapsed = now.saturating_duration_since(self.origin);
        let window = Duration::from_secs(self.span_secs);
        snap.span = elapsed.clamp(Duration::from_secs(1), window);
        snap
    }

    pub fn rate(&self, now: Instant) -> f64 {
        self.snapshot(now).rate()
    }
}

impl std::fmt::Debug for SlidingWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindow")
            .field("span_secs", &self.span_secs)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_over_full_window() {
        let origin = Instant::now();
        let window = SlidingWindow::starting_at(Duration::from_secs(10), origin);
        for s in 0..20 {
            window.record(origin + Duration::from_secs(s), 5, 0);
        }
        let now = origin + Duration::from_millis(19_500);
        let snap = window.snapshot(now);
        assert_eq!(snap.count, 50);
        assert!((snap.rate() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn young_window_divides_by_elapsed_time() {
        let origin = Instant::now();
        let window = SlidingWindow::starting_at(Duration::from_secs(30), origin);
        window.record(origin, 10, 0);
        window.record(origin + Duration::from_secs(1), 10, 0);
        let rate = window.rate(origin + Duration::from_secs(2));
        assert!((rate - 10.0).abs() < 1e-9);
    }

    #[test]
    fn stale_buckets_are_ignored() {
        let origin = Instant::now();
        let window = SlidingWindow::starting_at(Duration::from_secs(5), origin);
        window.record(origin, 100, 0);
        assert_eq!(window.snapshot(origin + Duration::from_secs(30)).count, 0);
    }

    #[test]
    fn mean_and_variation_of_values() {
        let origin = Instant::now();
        let window = SlidingWindow::starting_at(Duration::from_secs(5), origin);
        window.record(origin, 1, 10);
        window.record(origin, 1, 10);
        let snap = window.snapshot(origin);
        assert_eq!(snap.mean(), Some(10.0));
        assert_eq!(snap.coefficient_of_variation(), Some(0.0));
    }
}
