//! Batched (work-stealing) scheduler.
//!
//! The index space is split into one contiguous batch per worker. A worker
//! drains its own batch from the head; once exhausted it steals from peers,
//! preferring requeued segments whose delay has elapsed, otherwise taking
//! from the tail of a peer's remaining range. Each batch has its own lock and
//! stealing never holds two batch locks at once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{PendingRequeue, Slot};

pub(crate) struct BatchedScheduler {
    batches: Vec<Batch>,
    requeue_delay: Duration,
}

struct Batch {
    inner: Mutex<BatchInner>,
}

struct BatchInner {
    /// Next unclaimed index in this batch's range.
    next: usize,
    /// One past the last unclaimed index; `next == limit` means exhausted.
    limit: usize,
    assigned: bool,
    failed: VecDeque<PendingRequeue>,
}

impl BatchedScheduler {
    pub fn new(total: usize, threads: usize, requeue_delay: Duration) -> Self {
        assert!(threads >= 1, "batched scheduler needs at least one worker");
        let base = total / threads;
        let mut batches = Vec::with_capacity(threads);
        for i in 0..threads {
            // the last batch absorbs the division remainder
            let start = i * base;
            let limit = if i + 1 == threads { total } else { (i + 1) * base };
            batches.push(Batch {
                inner: Mutex::new(BatchInner {
                    next: start,
                    limit,
                    assigned: false,
                    failed: VecDeque::new(),
                }),
            });
        }
        BatchedScheduler {
            batches,
            requeue_delay,
        }
    }
}

pub(crate) fn create_queue(sched: &Arc<BatchedScheduler>, worker: usize) -> BatchedQueue {
    let Some(batch) = sched.batches.get(worker) else {
        panic!(
            "invalid worker number {} (worker count: {})",
            worker,
            sched.batches.len()
        );
    };
    let mut inner = batch.inner.lock().unwrap();
    if inner.assigned {
        panic!("queue for worker {worker} has already been created");
    }
    inner.assigned = true;
    drop(inner);
    BatchedQueue {
        sched: Arc::clone(sched),
        index: worker,
    }
}

/// One worker's batch plus access to its peers for stealing.
pub struct BatchedQueue {
    sched: Arc<BatchedScheduler>,
    index: usize,
}

impl BatchInner {
    /// Pops the head of the failed queue. When the caller still has normal
    /// segments available (`has_non_failed`), a not-yet-ready entry is left
    /// waiting instead of being taken early.
    fn try_get_failed(&mut self, has_non_failed: bool) -> Option<PendingRequeue> {
        let front = self.failed.front()?;
        if has_non_failed && !front.is_ready() {
            return None;
        }
        self.failed.pop_front()
    }
}

impl Batch {
    fn try_get_next(&self) -> Option<Slot> {
        let mut inner = self.inner.lock().unwrap();
        if inner.next >= inner.limit {
            return inner.try_get_failed(false).map(Slot::Retry);
        }
        let seg = inner.next;
        inner.next += 1;
        Some(Slot::Fresh(seg))
    }

    fn try_steal(&self) -> Option<Slot> {
        let mut inner = self.inner.lock().unwrap();
        // prefer the failed queue over the normal range, but if its head is
        // still waiting out the delay and normal segments remain, leave it
        // for the owner
        let has_non_failed = inner.next < inner.limit;
        if let Some(f) = inner.try_get_failed(has_non_failed) {
            return Some(Slot::Retry(f));
        }
        if inner.next >= inner.limit {
            return None;
        }
        inner.limit -= 1;
        Some(Slot::Fresh(inner.limit))
    }
}

impl BatchedQueue {
    pub(crate) fn next_internal(&self) -> Option<Slot> {
        if let Some(slot) = self.sched.batches[self.index].try_get_next() {
            return Some(slot);
        }
        // scan peers in construction order; no randomization
        for (i, peer) in self.sched.batches.iter().enumerate() {
            if i == self.index {
                continue;
            }
            if let Some(slot) = peer.try_steal() {
                return Some(slot);
            }
        }
        None
    }

    /// Requeues always land in the worker's own batch, not the batch the
    /// segment originally came from.
    pub(crate) fn requeue_failed(&self, seg: usize, fails: u32) {
        let mut inner = self.sched.batches[self.index].inner.lock().unwrap();
        inner
            .failed
            .push_back(PendingRequeue::new(seg, fails, self.sched.requeue_delay));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(sched: &BatchedScheduler) -> Vec<(usize, usize)> {
        sched
            .batches
            .iter()
            .map(|b| {
                let inner = b.inner.lock().unwrap();
                (inner.next, inner.limit)
            })
            .collect()
    }

    #[test]
    fn partition_gives_last_batch_the_remainder() {
        let s = BatchedScheduler::new(10, 3, Duration::ZERO);
        assert_eq!(ranges(&s), vec![(0, 3), (3, 6), (6, 10)]);
    }

    #[test]
    fn partition_with_fewer_segments_than_threads_creates_empty_batches() {
        let s = BatchedScheduler::new(2, 4, Duration::ZERO);
        assert_eq!(ranges(&s), vec![(0, 0), (0, 0), (0, 0), (0, 2)]);
    }

    #[test]
    #[should_panic(expected = "invalid worker number")]
    fn out_of_range_worker_panics() {
        let s = Arc::new(BatchedScheduler::new(10, 2, Duration::ZERO));
        let _ = create_queue(&s, 2);
    }

    #[test]
    #[should_panic(expected = "already been created")]
    fn double_queue_creation_panics() {
        let s = Arc::new(BatchedScheduler::new(10, 2, Duration::ZERO));
        let _ = create_queue(&s, 0);
        let _ = create_queue(&s, 0);
    }

    #[test]
    fn steal_takes_from_the_tail() {
        let s = Arc::new(BatchedScheduler::new(8, 2, Duration::ZERO));
        let q0 = create_queue(&s, 0);
        // batch 0 is [0, 4), batch 1 is [4, 8); drain own batch first
        for expect in 0..4 {
            match q0.next_internal() {
                Some(Slot::Fresh(seg)) => assert_eq!(seg, expect),
                _ => panic!("expected fresh segment"),
            }
        }
        match q0.next_internal() {
            Some(Slot::Fresh(seg)) => assert_eq!(seg, 7),
            _ => panic!("expected stolen tail segment"),
        }
    }

    #[test]
    fn steal_prefers_ready_failed_entries() {
        let s = Arc::new(BatchedScheduler::new(4, 2, Duration::ZERO));
        let q0 = create_queue(&s, 0);
        let q1 = create_queue(&s, 1);
        while matches!(q0.next_internal(), Some(Slot::Fresh(_))) {}
        q1.requeue_failed(3, 2);
        match q0.next_internal() {
            Some(Slot::Retry(f)) => assert_eq!((f.seg, f.fails), (3, 2)),
            _ => panic!("expected to steal the requeued segment"),
        }
    }

    #[test]
    fn unready_failed_entry_is_left_for_its_owner_while_work_remains() {
        let s = Arc::new(BatchedScheduler::new(4, 2, Duration::from_secs(60)));
        let q0 = create_queue(&s, 0);
        let q1 = create_queue(&s, 1);
        // drain only worker 0's own range [0, 2)
        for _ in 0..2 {
            assert!(matches!(q0.next_internal(), Some(Slot::Fresh(_))));
        }
        // worker 1 still has its normal range; its delayed requeue must not
        // be stolen, but its tail segments may be
        q1.requeue_failed(0, 1);
        match q0.next_internal() {
            Some(Slot::Fresh(seg)) => assert_eq!(seg, 3),
            _ => panic!("expected tail steal, not the delayed requeue"),
        }
    }
}
