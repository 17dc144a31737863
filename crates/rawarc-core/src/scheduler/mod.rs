//! Segment schedulers.
//!
//! Both variants hand out `(segment, requeue_count)` pairs through per-worker
//! queues and accept failed segments back for a delayed second chance. The
//! sequential scheduler shares one counter between all workers; the batched
//! scheduler gives each worker a contiguous range and lets idle workers steal
//! from their peers.

mod batched;
mod sequential;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

pub(crate) use batched::BatchedScheduler;
pub(crate) use sequential::SequentialScheduler;

/// Order segments are assigned to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    #[default]
    Sequential,
    OutOfOrder,
    Auto,
}

/// A failed segment waiting out its requeue delay.
#[derive(Debug, Clone)]
pub(crate) struct PendingRequeue {
    seg: usize,
    fails: u32,
    ready_at: Instant,
}

impl PendingRequeue {
    fn new(seg: usize, fails: u32, delay: Duration) -> Self {
        PendingRequeue {
            seg,
            fails,
            ready_at: Instant::now() + delay,
        }
    }

    fn is_ready(&self) -> bool {
        Instant::now() >= self.ready_at
    }

    async fn wait(&self) {
        let delay = self.ready_at.saturating_duration_since(Instant::now());
        if delay > Duration::from_secs(1) {
            tracing::debug!("waiting {:?} before retrying segment {}", delay, self.seg);
        }
        tokio::time::sleep_until(self.ready_at).await;
    }
}

/// What a queue produced before any ready_at wait has been served.
pub(crate) enum Slot {
    Fresh(usize),
    Retry(PendingRequeue),
}

async fn deliver(slot: Option<Slot>) -> Option<(usize, u32)> {
    match slot? {
        Slot::Fresh(seg) => Some((seg, 0)),
        Slot::Retry(f) => {
            // the scheduler lock is no longer held here
            f.wait().await;
            Some((f.seg, f.fails))
        }
    }
}

pub(crate) enum Scheduler {
    Sequential(Arc<SequentialScheduler>),
    Batched(Arc<BatchedScheduler>),
}

impl Scheduler {
    pub fn new(mode: QueueMode, total: usize, threads: usize, requeue_delay: Duration) -> Self {
        match mode {
            QueueMode::OutOfOrder => {
                Scheduler::Batched(Arc::new(BatchedScheduler::new(total, threads, requeue_delay)))
            }
            QueueMode::Sequential | QueueMode::Auto => {
                Scheduler::Sequential(Arc::new(SequentialScheduler::new(total, requeue_delay)))
            }
        }
    }

    pub fn create_queue(&self, worker: usize) -> WorkQueue {
        match self {
            Scheduler::Sequential(s) => WorkQueue::Sequential(sequential::create_queue(s)),
            Scheduler::Batched(s) => WorkQueue::Batched(batched::create_queue(s, worker)),
        }
    }
}

/// One worker's view of the scheduler.
pub enum WorkQueue {
    Sequential(sequential::SequentialQueue),
    Batched(batched::BatchedQueue),
}

impl WorkQueue {
    /// Next `(segment, requeue_count)`, or `None` when no work remains.
    /// Waiting on a requeued segment's delay happens without any lock held.
    pub async fn next_segment(&self) -> Option<(usize, u32)> {
        match self {
            WorkQueue::Sequential(q) => deliver(q.next_internal()).await,
            WorkQueue::Batched(q) => deliver(q.next_internal()).await,
        }
    }

    /// Puts a segment that exceeded its retry budget back for another pass.
    pub fn requeue_failed(&self, seg: usize, fails: u32) {
        match self {
            WorkQueue::Sequential(q) => q.requeue_failed(seg, fails),
            WorkQueue::Batched(q) => q.requeue_failed(seg, fails),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    async fn drain_all(scheduler: Scheduler, threads: usize) -> Vec<usize> {
        let scheduler = Arc::new(scheduler);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for worker in 0..threads {
            let queue = scheduler.create_queue(worker);
            let seen = Arc::clone(&seen);
            handles.push(tokio::spawn(async move {
                while let Some((seg, _)) = queue.next_segment().await {
                    seen.lock().unwrap().push(seg);
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let mut v = seen.lock().unwrap().clone();
        v.sort_unstable();
        v
    }

    #[tokio::test]
    async fn sequential_delivers_each_segment_exactly_once() {
        let s = Scheduler::new(QueueMode::Sequential, 100, 4, Duration::ZERO);
        let seen = drain_all(s, 4).await;
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn batched_delivers_each_segment_exactly_once() {
        let s = Scheduler::new(QueueMode::OutOfOrder, 100, 4, Duration::ZERO);
        let seen = drain_all(s, 4).await;
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn more_threads_than_segments_still_terminates() {
        let s = Scheduler::new(QueueMode::OutOfOrder, 3, 8, Duration::ZERO);
        let seen = drain_all(s, 8).await;
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn zero_segments_ends_immediately() {
        for mode in [QueueMode::Sequential, QueueMode::OutOfOrder] {
            let s = Scheduler::new(mode, 0, 2, Duration::ZERO);
            assert!(drain_all(s, 2).await.is_empty());
        }
    }

    #[tokio::test]
    async fn auto_mode_behaves_sequentially() {
        let s = Scheduler::new(QueueMode::Auto, 5, 2, Duration::ZERO);
        let q = s.create_queue(0);
        let mut order = Vec::new();
        while let Some((seg, _)) = q.next_segment().await {
            order.push(seg);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn requeued_segment_comes_back_with_its_fail_count() {
        let s = Scheduler::new(QueueMode::Sequential, 2, 1, Duration::ZERO);
        let q = s.create_queue(0);
        assert_eq!(q.next_segment().await, Some((0, 0)));
        assert_eq!(q.next_segment().await, Some((1, 0)));
        q.requeue_failed(1, 3);
        assert_eq!(q.next_segment().await, Some((1, 3)));
        assert_eq!(q.next_segment().await, None);
    }

    #[tokio::test]
    async fn requeues_move_between_batched_workers_via_stealing() {
        let s = Scheduler::new(QueueMode::OutOfOrder, 4, 2, Duration::ZERO);
        let q0 = s.create_queue(0);
        let q1 = s.create_queue(1);

        // drain worker 1's own range, then requeue one of its segments
        let mut own = HashSet::new();
        own.insert(q1.next_segment().await.unwrap().0);
        own.insert(q1.next_segment().await.unwrap().0);
        assert_eq!(own, HashSet::from([2, 3]));
        q1.requeue_failed(2, 1);

        // worker 0 finishes its range and steals the requeued segment
        let mut seen = Vec::new();
        while let Some((seg, fails)) = q0.next_segment().await {
            seen.push((seg, fails));
        }
        assert!(seen.contains(&(2, 1)));
    }
}
