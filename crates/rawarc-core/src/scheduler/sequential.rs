//! Sequential scheduler: all workers draw from one shared counter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{PendingRequeue, Slot};

pub(crate) struct SequentialScheduler {
    max: usize,
    requeue_delay: Duration,
    inner: Mutex<Inner>,
}

struct Inner {
    next: usize,
    failed: VecDeque<PendingRequeue>,
}

impl SequentialScheduler {
    pub fn new(total: usize, requeue_delay: Duration) -> Self {
        SequentialScheduler {
            max: total,
            requeue_delay,
            inner: Mutex::new(Inner {
                next: 0,
                failed: VecDeque::new(),
            }),
        }
    }
}

pub(crate) fn create_queue(sched: &Arc<SequentialScheduler>) -> SequentialQueue {
    SequentialQueue {
        sched: Arc::clone(sched),
    }
}

/// A worker handle; all handles share the scheduler state.
pub struct SequentialQueue {
    sched: Arc<SequentialScheduler>,
}

impl SequentialQueue {
    pub(crate) fn next_internal(&self) -> Option<Slot> {
        let mut inner = self.sched.inner.lock().unwrap();
        if inner.next < self.sched.max {
            let seg = inner.next;
            inner.next += 1;
            return Some(Slot::Fresh(seg));
        }
        inner.failed.pop_front().map(Slot::Retry)
    }

    pub(crate) fn requeue_failed(&self, seg: usize, fails: u32) {
        let mut inner = self.sched.inner.lock().unwrap();
        inner
            .failed
            .push_back(PendingRequeue::new(seg, fails, self.sched.requeue_delay));
    }
}
