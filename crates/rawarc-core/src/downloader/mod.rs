//! Per-stream download pipeline.
//!
//! One `DownloadTask` runs a whole stream: it discovers the segment count,
//! spawns the merger and `threads` worker tasks over a shared scheduler, and
//! reports the lost segments once everything has been consumed.

mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::Instrument;

use crate::merge::Merger;
use crate::net::HttpClientPool;
use crate::progress::{ProgressHandle, StreamKind};
use crate::retry::RetryPolicy;
use crate::scheduler::QueueMode;
use crate::status::SegmentStatus;
use crate::url_model::ParsedUrl;

pub struct DownloadTask {
    pub pool: Arc<HttpClientPool>,
    pub url: ParsedUrl,
    pub threads: usize,
    pub queue_mode: QueueMode,
    pub retry: RetryPolicy,
    pub requeue_delay: Duration,
    pub fsync: bool,
    pub segment_dir: PathBuf,
    /// Explicit segment count; 0 discovers it from the `x-head-seqnum`
    /// response header of segment 0.
    pub segment_count: usize,
    pub merger: Arc<dyn Merger>,
    pub progress: ProgressHandle,
}

pub struct DownloadResult {
    pub total_segments: usize,
    pub lost_segments: Vec<usize>,
    pub error: Option<anyhow::Error>,
}

impl DownloadTask {
    /// Spawns the pipeline; the handle resolves once every segment has been
    /// consumed as downloaded, cached or lost.
    pub fn start(self) -> tokio::task::JoinHandle<DownloadResult> {
        let span = match self.progress.which() {
            StreamKind::Audio => tracing::info_span!("audio"),
            StreamKind::Video => tracing::info_span!("video"),
        };
        tokio::spawn(self.run().instrument(span))
    }

    async fn run(self) -> DownloadResult {
        let total = match self.discover_total().await {
            Ok(total) => total,
            Err(e) => {
                return DownloadResult {
                    total_segments: 0,
                    lost_segments: Vec::new(),
                    error: Some(e),
                }
            }
        };
        tracing::info!("total segments: {total}");

        let threads = self.threads.max(1);
        self.progress.init(total, self.url.expire());

        let status = SegmentStatus::create(total, threads, self.queue_mode, self.requeue_delay);

        {
            let merger = Arc::clone(&self.merger);
            let status = Arc::clone(&status);
            tokio::spawn(async move { merger.merge(status).await });
        }

        let dispose_threshold = self.retry.dispose_threshold(self.queue_mode);
        let mut handles = Vec::with_capacity(threads);
        for index in 0..threads {
            let worker = worker::Worker {
                index,
                queue: status.create_queue(index),
                requester: self.pool.get_requester(),
                status: Arc::clone(&status),
                url: self.url.clone(),
                retry: self.retry,
                dispose_threshold,
                fsync: self.fsync,
                segment_dir: self.segment_dir.clone(),
                progress: self.progress.clone(),
            };
            handles.push(tokio::spawn(
                worker.run().instrument(tracing::Span::current()),
            ));
        }

        let mut error = None;
        for handle in handles {
            if let Err(e) = handle.await {
                if error.is_none() {
                    error = Some(anyhow::anyhow!("download worker panicked: {e}"));
                }
            }
        }

        DownloadResult {
            total_segments: total,
            lost_segments: status.missed_segments(),
            error,
        }
    }

    async fn discover_total(&self) -> Result<usize> {
        if self.segment_count > 0 {
            tracing::debug!("using configured segment count {}", self.segment_count);
            return Ok(self.segment_count);
        }

        tracing::info!("getting total segments");
        let requester = self.pool.get_requester();
        let url = self.url.segment_url(0);
        let response = requester
            .get(&url)
            .await
            .context("segment count request failed")?;

        let Some(header) = response.header("x-head-seqnum") else {
            bail!(
                "unable to get segment count, response status: {}",
                response.status()
            );
        };
        let count: usize = header
            .parse()
            .with_context(|| format!("unable to parse x-head-seqnum '{header}'"))?;
        Ok(count)
    }
}
