//! Shared segment-status store.
//!
//! Downloaders publish per-segment results here; the merger consumes them in
//! strictly increasing order through `next_to_merge`. One mutex guards the
//! buffered results, the merge cursor and the list of permanently failed
//! segments, and it is only ever held for pointer-sized updates.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::{QueueMode, Scheduler, WorkQueue};

/// Outcome of one segment download. Failed segments have `ok == false` and no
/// filename. Field names match the download-only JSON wire format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentResult {
    #[serde(rename = "Filename")]
    pub filename: Option<PathBuf>,
    #[serde(rename = "Ok")]
    pub ok: bool,
}

impl SegmentResult {
    pub fn done(filename: PathBuf) -> Self {
        SegmentResult {
            filename: Some(filename),
            ok: true,
        }
    }

    pub fn lost() -> Self {
        SegmentResult {
            filename: None,
            ok: false,
        }
    }
}

pub struct SegmentStatus {
    end: usize,
    scheduler: Scheduler,
    inner: Mutex<Inner>,
}

struct Inner {
    merged_count: usize,
    segments: HashMap<usize, SegmentResult>,
    missed: Vec<usize>,
}

impl SegmentStatus {
    pub fn create(
        segment_count: usize,
        threads: usize,
        mode: QueueMode,
        requeue_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(SegmentStatus {
            end: segment_count,
            scheduler: Scheduler::new(mode, segment_count, threads, requeue_delay),
            inner: Mutex::new(Inner {
                merged_count: 0,
                segments: HashMap::new(),
                missed: Vec::new(),
            }),
        })
    }

    /// Each worker gets its own queue over the shared scheduler.
    pub fn create_queue(&self, worker: usize) -> WorkQueue {
        self.scheduler.create_queue(worker)
    }

    pub fn is_last(&self, segment: usize) -> bool {
        segment + 1 == self.end
    }

    pub fn total(&self) -> usize {
        self.end
    }

    /// Indices that were published as permanently failed, in publication order.
    pub fn missed_segments(&self) -> Vec<usize> {
        self.inner.lock().unwrap().missed.clone()
    }

    /// Returns the result at the merge cursor and advances it, or the cursor
    /// position and `None` when that segment has not been published yet.
    pub fn next_to_merge(&self) -> (usize, Option<SegmentResult>) {
        let mut inner = self.inner.lock().unwrap();
        let number = inner.merged_count;
        let result = inner.segments.remove(&number);
        if result.is_some() {
            inner.merged_count += 1;
        }
        (number, result)
    }

    /// A downloader finished (or gave up on) `number`.
    pub fn downloaded(&self, number: usize, result: SegmentResult) {
        let mut inner = self.inner.lock().unwrap();
        if !result.ok {
            inner.missed.push(number);
        }
        inner.segments.insert(number, result);
    }

    /// True once every segment has been merged.
    pub fn done(&self) -> bool {
        self.inner.lock().unwrap().merged_count == self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(total: usize) -> Arc<SegmentStatus> {
        SegmentStatus::create(total, 1, QueueMode::Sequential, Duration::ZERO)
    }

    #[test]
    fn merge_cursor_waits_for_the_next_index() {
        let s = status(3);
        s.downloaded(1, SegmentResult::done("b".into()));
        // segment 0 not published yet, the cursor must not move
        let (n, r) = s.next_to_merge();
        assert_eq!(n, 0);
        assert!(r.is_none());

        s.downloaded(0, SegmentResult::done("a".into()));
        let (n, r) = s.next_to_merge();
        assert_eq!(n, 0);
        assert_eq!(r.unwrap().filename.unwrap(), PathBuf::from("a"));
        let (n, r) = s.next_to_merge();
        assert_eq!(n, 1);
        assert!(r.is_some());
    }

    #[test]
    fn cursor_is_monotonic_and_bounded() {
        let s = status(2);
        s.downloaded(0, SegmentResult::done("a".into()));
        s.downloaded(1, SegmentResult::done("b".into()));
        assert_eq!(s.next_to_merge().0, 0);
        assert_eq!(s.next_to_merge().0, 1);
        assert!(s.done());
        // a consumer polling past the end keeps seeing the end position
        let (n, r) = s.next_to_merge();
        assert_eq!(n, 2);
        assert!(r.is_none());
    }

    #[test]
    fn failed_results_are_recorded_as_missed() {
        let s = status(2);
        s.downloaded(0, SegmentResult::lost());
        s.downloaded(1, SegmentResult::done("b".into()));
        assert_eq!(s.missed_segments(), vec![0]);
        let (_, r) = s.next_to_merge();
        assert!(!r.unwrap().ok);
    }

    #[test]
    fn is_last_and_done_edges() {
        let s = status(0);
        assert!(s.done());
        let s = status(5);
        assert!(s.is_last(4));
        assert!(!s.is_last(3));
        assert!(!s.done());
    }

    #[test]
    fn segment_result_round_trips_through_json() {
        let r = SegmentResult::done("segment-x_140.3.done".into());
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"Filename\""));
        assert!(json.contains("\"Ok\":true"));
        let back: SegmentResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }
}
