//! Per-worker fetch loop.

use std::path::PathBuf;
use std::sync::Arc;

use crate::net::Requester;
use crate::progress::ProgressHandle;
use crate::retry::RetryPolicy;
use crate::scheduler::WorkQueue;
use crate::segfile::SegmentFile;
use crate::status::{SegmentResult, SegmentStatus};
use crate::url_model::ParsedUrl;

enum FetchFailure {
    /// All transport attempts failed; counts toward client replacement.
    Transport,
    /// The server answered with a non-200 status.
    BadStatus,
    /// Writing the segment file failed; the partial file was removed.
    Io,
}

pub(super) struct Worker {
    pub index: usize,
    pub queue: WorkQueue,
    pub requester: Arc<Requester>,
    pub status: Arc<SegmentStatus>,
    pub url: ParsedUrl,
    pub retry: RetryPolicy,
    pub dispose_threshold: u32,
    pub fsync: bool,
    pub segment_dir: PathBuf,
    pub progress: ProgressHandle,
}

impl Worker {
    pub async fn run(self) {
        tracing::debug!("worker {} started", self.index);
        while let Some((segment, requeues)) = self.queue.next_segment().await {
            tracing::debug!("current segment: {segment}");
            self.handle_segment(segment, requeues).await;
        }
        tracing::debug!("worker {} done", self.index);
    }

    async fn handle_segment(&self, segment: usize, requeues: u32) {
        let file = SegmentFile::new(&self.segment_dir, self.url.id(), self.url.itag(), segment);

        if let Some(done) = file.cached() {
            tracing::debug!("reusing previously downloaded segment {segment}");
            self.status.downloaded(segment, SegmentResult::done(done));
            self.progress.done(segment, true);
            return;
        }

        let is_last = self.status.is_last(segment);
        let budget = self.retry.effective_budget(is_last);
        let mut fail_count: u32 = 0;
        let mut network_fails: u32 = 0;

        loop {
            match self.fetch_once(segment, &file).await {
                Ok(path) => {
                    tracing::debug!("downloaded segment {segment}");
                    self.status.downloaded(segment, SegmentResult::done(path));
                    self.progress.done(segment, false);
                    return;
                }
                Err(failure) => {
                    if matches!(failure, FetchFailure::Transport) {
                        network_fails += 1;
                    }
                    fail_count += 1;
                    tracing::debug!("failed segment {segment} [{fail_count}/{budget}]");

                    if network_fails >= self.dispose_threshold {
                        tracing::debug!(
                            "too many connection failures on segment {segment}, replacing HTTP client"
                        );
                        self.requester.dispose();
                        // network failures that forced the replacement don't
                        // count against the segment's budget
                        fail_count = fail_count.saturating_sub(network_fails);
                        network_fails = 0;
                    }

                    if fail_count >= budget {
                        if self.retry.may_requeue(requeues, is_last) {
                            tracing::warn!(
                                "requeuing segment {segment} (attempt {})",
                                requeues + 1
                            );
                            self.queue.requeue_failed(segment, requeues + 1);
                            self.progress.requeued(segment);
                        } else {
                            tracing::warn!("giving up segment {segment}");
                            self.status.downloaded(segment, SegmentResult::lost());
                            self.progress.lost(segment);
                        }
                        return;
                    }

                    tokio::time::sleep(self.retry.backoff(fail_count)).await;
                }
            }
        }
    }

    async fn fetch_once(&self, segment: usize, file: &SegmentFile) -> Result<PathBuf, FetchFailure> {
        let target = self.url.segment_url(segment);

        let mut response = None;
        for _ in 0..self.retry.connect_retries.max(1) {
            match self.requester.get(&target).await {
                Ok(r) => {
                    response = Some(r);
                    break;
                }
                Err(e) => tracing::debug!("request for segment {segment} failed with {e}"),
            }
        }
        let Some(mut response) = response else {
            return Err(FetchFailure::Transport);
        };

        if response.status() != 200 {
            tracing::debug!(
                "non-200 status code {} for segment {segment}",
                response.status()
            );
            // hitting the base URL refreshes server-side state for some URL
            // variants; the response itself is unused
            if let Ok(r) = self.requester.get(self.url.base_url()).await {
                r.discard().await;
            }
            return Err(FetchFailure::BadStatus);
        }

        match file.write(&mut response, self.fsync).await {
            Ok(path) => Ok(path),
            Err(e) => {
                tracing::error!("unable to write segment {segment}: {e:#}");
                Err(FetchFailure::Io)
            }
        }
    }
}
