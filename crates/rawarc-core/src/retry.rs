//! Per-segment retry, backoff and client-replacement policy.
//!
//! The budget applies per segment delivery; a segment that exhausts it is
//! either requeued (bounded by `requeue_failed_max`) or published as lost.
//! The last segment gets a reduced budget since the live tail is often not
//! available at all.

use std::time::Duration;

use crate::scheduler::QueueMode;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Failures tolerated per segment delivery.
    pub fail_threshold: u32,
    /// Transport attempts within one fetch.
    pub connect_retries: u32,
    /// Times a segment may be requeued after exhausting its budget.
    pub requeue_failed_max: u32,
    /// Whether the final segment may be requeued at all.
    pub requeue_last: bool,
    /// Base unit of the backoff curve; sleeps are `base * 2^min(fails, 2)`.
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            fail_threshold: 20,
            connect_retries: 3,
            requeue_failed_max: 2,
            requeue_last: false,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// The failure budget for one delivery of a segment.
    pub fn effective_budget(&self, is_last: bool) -> u32 {
        if is_last {
            (self.fail_threshold / 4).max(5)
        } else {
            self.fail_threshold
        }
    }

    /// Sleep after the `fail_count`-th failure: 2s, 4s, 4s, …
    pub fn backoff(&self, fail_count: u32) -> Duration {
        self.backoff_base * (1u32 << fail_count.min(2))
    }

    /// Network failures tolerated on one segment before the worker replaces
    /// its HTTP client.
    pub fn dispose_threshold(&self, mode: QueueMode) -> u32 {
        match mode {
            QueueMode::OutOfOrder => 4,
            QueueMode::Sequential | QueueMode::Auto => (self.fail_threshold / 2).max(1),
        }
    }

    /// Whether a segment that exhausted its budget goes back to the queue.
    pub fn may_requeue(&self, requeues: u32, is_last: bool) -> bool {
        requeues < self.requeue_failed_max && (!is_last || self.requeue_last)
    }
}
