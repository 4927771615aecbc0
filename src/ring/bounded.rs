use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::time::Instant;

use super::stats::{RingCounters, RingStats};
use super::{JobRing, RingError};
use crate::jobs::Job;

struct Slot {
    /// `pos` when free for the producer at `pos`, `pos + 1` once written,
    /// `pos + capacity` after the consumer has taken it.
    seq: AtomicUsize,
    value: UnsafeCell<MaybeUninit<Job>>,
}

/// Fixed-capacity MPMC ring with per-slot sequence numbers.
///
/// A batch claims a contiguous run of positions with one CAS on `tail`
/// (or `head`) after checking that every slot in the run is ready, which
/// makes `enqueue_batch` all-or-nothing. `crossbeam_queue::ArrayQueue`
/// only claims one slot per CAS, so a batch pushed into it can land half
/// way when the ring fills.
///
/// Slot ownership follows `seq`: a producer may write slot `pos` only while
/// `seq == pos`, a consumer may read it only while `seq == pos + 1`, and the
/// head/tail CAS hands each position to exactly one thread per lap.
pub struct BoundedRing {
    buffer: Box<[Slot]>,
    mask: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    closed: AtomicBool,
    counters: RingCounters,
}

// SAFETY: `Job` is `Send`, and the only non-`Sync` field is the slot's
// `UnsafeCell`. Its value is touched only by the one thread whose head/tail
// CAS covered that position, never by two threads for the same lap. The
// write is published by the Release store of `seq = pos + 1` and the read
// happens after an Acquire load observed it, so the consumer sees the whole
// job. The consumer's Release store of `seq = pos + capacity` likewise
// orders its read before the next producer's write.
unsafe impl Send for BoundedRing {}
unsafe impl Sync for BoundedRing {}

enum Scan {
    Ready(usize),
    Contended,
}

impl BoundedRing {
    /// Capacity is rounded up to a power of two (minimum 2).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let buffer = (0..capacity)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            buffer,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            counters: RingCounters::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    fn slot(&self, pos: usize) -> &Slot {
        &self.buffer[pos & self.mask]
    }

    /// Checks that `n` slots starting at `tail` are free for this lap.
    fn scan_free(&self, tail: usize, n: usize) -> Result<Scan, RingError> {
        for i in 0..n {
            let pos = tail.wrapping_add(i);
            let seq = self.slot(pos).seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;
            if diff < 0 {
                return Err(RingError::Full);
            }
            if diff > 0 {
                return Ok(Scan::Contended);
            }
        }
        Ok(Scan::Ready(n))
    }

    /// Counts up to `max` consecutive written slots starting at `head`.
    fn scan_filled(&self, head: usize, max: usize) -> Scan {
        let mut ready = 0;
        while ready < max {
            let pos = head.wrapping_add(ready);
            let seq = self.slot(pos).seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;
            if diff == 0 {
                ready += 1;
            } else if diff < 0 || ready > 0 {
                break;
            } else {
                return Scan::Contended;
            }
        }
        Scan::Ready(ready)
    }

    fn try_take(&self, max: usize) -> Vec<Job> {
        if max == 0 {
            return Vec::new();
        }
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let n = match self.scan_filled(head, max) {
                Scan::Ready(0) => return Vec::new(),
                Scan::Ready(n) => n,
                Scan::Contended => {
                    std::hint::spin_loop();
                    continue;
                }
            };
            if self
                .head
                .compare_exchange_weak(head, head.wrapping_add(n), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let mut jobs = Vec::with_capacity(n);
            for i in 0..n {
                let pos = head.wrapping_add(i);
                let slot = self.slot(pos);
                // SAFETY: the CAS moved `head` past [head, head + n), so no other
                // consumer can claim these positions this lap, and no producer can
                // touch them until `seq` is bumped below. `scan_filled` saw
                // seq == pos + 1 with Acquire, so the value is initialised and
                // fully visible. It is read exactly once and the slot is marked
                // free right after, so nothing drops or reads it twice.
                let job = unsafe { (*slot.value.get()).assume_init_read() };
                slot.seq.store(pos.wrapping_add(self.capacity()), Ordering::Release);
                jobs.push(job);
            }
            return jobs;
        }
    }
}

impl JobRing for BoundedRing {
    fn enqueue_batch(&self, jobs: &mut Vec<Job>) -> Result<(), RingError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RingError::Closed);
        }
        let n = jobs.len();
        if n == 0 {
            return Ok(());
        }
        if n > self.capacity() {
            self.counters.on_reject(n);
            return Err(RingError::Full);
        }
        loop {
            let tail = self.tail.load(Ordering::Relaxed);
            match self.scan_free(tail, n) {
                Err(e) => {
                    self.counters.on_reject(n);
                    return Err(e);
                }
                Ok(Scan::Contended) => {
                    std::hint::spin_loop();
                    continue;
                }
                Ok(Scan::Ready(_)) => {}
            }
            if self
                .tail
                .compare_exchange_weak(tail, tail.wrapping_add(n), Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            let now = Instant::now();
            for (i, mut job) in jobs.drain(..).enumerate() {
                job.enqueued_at = Some(now);
                let pos = tail.wrapping_add(i);
                let slot = self.slot(pos);
                // SAFETY: the CAS moved `tail` past [tail, tail + n), so no other
                // producer can claim these positions this lap. `scan_free` saw
                // seq == pos with Acquire for every slot, so each previous value
                // was already moved out and consumers skip the slot until the
                // Release store below. Writing into `MaybeUninit` drops nothing.
                unsafe { (*slot.value.get()).write(job) };
                slot.seq.store(pos.wrapping_add(1), Ordering::Release);
            }
            self.counters.on_enqueue(now, n);
            return Ok(());
        }
    }

    fn dequeue_batch(&self, max: usize) -> Vec<Job> {
        let mut jobs = self.try_take(max);
        if !jobs.is_empty() {
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
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        (tail.wrapping_sub(head) as isize).max(0) as usize
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn discard(&self) -> usize {
        let mut dropped = 0;
        loop {
            let batch = self.try_take(1024);
            if batch.is_empty() {
                break;
            }
            dropped += batch.len();
        }
        self.counters.on_drop(dropped);
        dropped
    }

    fn record_dropped(&self, n: usize) {
        self.counters.on_drop(n);
    }

    fn stats(&self) -> RingStats {
        self.counters
            .snapshot("bounded", self.len(), Some(self.capacity()), self.is_closed())
    }
}

impl Drop for BoundedRing {
    // Moves out whatever is still published so the jobs' `Arc`s are released.
    fn drop(&mut self) {
        while !self.try_take(1024).is_empty() {}
    }
}

impl std::fmt::Debug for BoundedRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedRing")
            .field("capacity", &self.capacity())
            .field("len", &JobRing::len(self))
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::Pipeline;
    use crate::jobs::testing::noop;
    use crate::monitor::MonitorId;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn job(i: u32) -> Job {
        Job::new(MonitorId(i), Pipeline::Pulse, noop())
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(BoundedRing::new(1000).capacity(), 1024);
        assert_eq!(BoundedRing::new(0).capacity(), 2);
    }

    #[test]
    fn full_ring_rejects_and_keeps_batch() {
        let ring = BoundedRing::new(4);
        let mut first: Vec<Job> = (0..3).map(job).collect();
        ring.enqueue_batch(&mut first).unwrap();
        assert!(first.is_empty());

        let mut second: Vec<Job> = (3..5).map(job).collect();
        assert_eq!(ring.enqueue_batch(&mut second), Err(RingError::Full));
        assert_eq!(second.len(), 2);
        assert_eq!(JobRing::len(&ring), 3);

        assert!(ring.enqueue(job(9)).is_ok());
        assert_eq!(ring.enqueue(job(10)), Err(RingError::Full));
        let stats = ring.stats();
        assert_eq!(stats.rejected_total, 3);
        assert_eq!(stats.dropped_total, 0);
    }

    #[test]
    fn slots_are_reused_across_laps() {
        let ring = BoundedRing::new(4);
        for lap in 0..10u32 {
            let mut batch: Vec<Job> = (0..4).map(|i| job(lap * 4 + i)).collect();
            ring.enqueue_batch(&mut batch).unwrap();
            let out: Vec<u32> = ring.dequeue_batch(8).iter().map(|j| j.monitor.0).collect();
            assert_eq!(out, (lap * 4..lap * 4 + 4).collect::<Vec<_>>());
        }
        assert_eq!(JobRing::len(&ring), 0);
    }

    #[test]
    fn concurrent_producers_and_consumers_deliver_exactly_once() {
        let ring = Arc::new(BoundedRing::new(256));
        let producers = 4;
        let per_producer = 5_000u32;

        let mut handles = Vec::new();
        for p in 0..producers {
            let ring = Arc::clone(&ring);
            handles.push(std::thread::spawn(move || {
                let mut next = 0;
                while next < per_producer {
                    let end = (next + 7).min(per_producer);
                    let mut batch: Vec<Job> = (next..end).map(|i| job(p * per_producer + i)).collect();
                    while ring.enqueue_batch(&mut batch).is_err() {
                        std::thread::yield_now();
                    }
                    next = end;
                }
            }));
        }

        let total = (producers * per_producer) as usize;
        let seen = Arc::new(parking_lot::Mutex::new(Vec::with_capacity(total)));
        let mut consumers = Vec::new();
        for _ in 0..3 {
            let ring = Arc::clone(&ring);
            let seen = Arc::clone(&seen);
            consumers.push(std::thread::spawn(move || loop {
                let batch = ring.dequeue_batch(16);
                if batch.is_empty() {
                    if seen.lock().len() >= total {
                        break;
                    }
                    std::thread::yield_now();
                    continue;
                }
                seen.lock().extend(batch.into_iter().map(|j| j.monitor.0));
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
        for c in consumers {
            c.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), total);
        let unique: HashSet<u32> = seen.iter().copied().collect();
        assert_eq!(unique.len(), total);
        let stats = ring.stats();
        assert_eq!(stats.enqueued_total, stats.dequeued_total);
    }
}
