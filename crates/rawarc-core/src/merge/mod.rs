//! Merger back-ends.
//!
//! Every variant consumes segments in ascending order from the status store
//! and blocks until the whole stream has been merged. The TCP merger streams
//! segments to the muxer over a loopback socket while it runs; the concat
//! merger builds intermediate files and runs the muxer afterwards; the
//! download-only merger just records results into a replayable JSON.

mod concat;
mod download_only;
mod ffmpeg;
mod progress;
mod tcp;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;

pub use concat::ConcatMuxer;
pub use download_only::{feed_merger, merge_download_info, DownloadJson, DownloadOnlyMuxer};
pub use ffmpeg::{ContainerMuxer, FfmpegMuxer};
pub use tcp::TcpMuxer;

pub(crate) use progress::MergeProgress;

use crate::freg::FregJson;
use crate::progress::StreamKind;
use crate::status::{SegmentResult, SegmentStatus};
use crate::term::StatusSink;

/// A per-stream merger: consumes one status feed in order.
#[async_trait]
pub trait Merger: Send + Sync {
    /// Runs until `status.done()`; spawned by the download task once the
    /// segment count is known.
    async fn merge(&self, status: Arc<SegmentStatus>);

    /// Completes once `merge` has finished.
    async fn wait(&self);

    /// The input this stream contributes to the muxer; `None` for an ignored
    /// stream (the muxer then runs with a single input).
    fn muxer_input(&self) -> Option<String>;
}

#[derive(Clone)]
pub struct MuxerOptions {
    /// Delete retained segment files after the final mux succeeds.
    pub delete_segments: bool,
    /// Delete each segment file right after it was consumed. Disables resume.
    pub disable_resume: bool,
    /// Output path without extension; each muxer appends its own.
    pub final_file_base: String,
    pub freg: Arc<FregJson>,
    /// Delete and recreate pre-existing intermediate merge files.
    pub overwrite_temp: bool,
    pub temp_dir: PathBuf,
    pub ignore_audio: bool,
    pub ignore_video: bool,
    /// Per-merger key/value arguments (`tcp: bind_address=…`).
    pub merger_args: HashMap<String, HashMap<String, String>>,
    pub term: Arc<StatusSink>,
}

impl MuxerOptions {
    pub fn merger_argument(&self, merger: &str, key: &str) -> Option<&str> {
        Some(self.merger_args.get(merger)?.get(key)?.as_str())
    }

    fn ignored(&self, which: StreamKind) -> bool {
        match which {
            StreamKind::Audio => self.ignore_audio,
            StreamKind::Video => self.ignore_video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergerKind {
    Tcp,
    Concat,
    DownloadOnly,
}

impl FromStr for MergerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "tcp" => MergerKind::Tcp,
            "concat" => MergerKind::Concat,
            "download-only" => MergerKind::DownloadOnly,
            other => bail!("unknown merger '{other}'"),
        })
    }
}

impl fmt::Display for MergerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergerKind::Tcp => write!(f, "tcp"),
            MergerKind::Concat => write!(f, "concat"),
            MergerKind::DownloadOnly => write!(f, "download-only"),
        }
    }
}

/// Creates the requested muxer, or picks the best supported one: TCP when the
/// muxer understands `tcp://` inputs, otherwise concat over plain files.
pub async fn create_muxer(
    kind: Option<MergerKind>,
    options: MuxerOptions,
    runner: Arc<dyn ContainerMuxer>,
) -> Result<AnyMuxer> {
    let kind = match kind {
        Some(kind) => {
            if kind != MergerKind::DownloadOnly {
                runner.available().await.context("unable to find the muxer")?;
            }
            kind
        }
        None => {
            runner.available().await.context("unable to find the muxer")?;
            if runner.supports_protocol("tcp").await? {
                MergerKind::Tcp
            } else if runner.supports_protocol("file").await? {
                tracing::warn!("using concat merger");
                MergerKind::Concat
            } else {
                bail!("no supported muxer protocol, tried tcp and file");
            }
        }
    };

    Ok(match kind {
        MergerKind::Tcp => AnyMuxer::Tcp(TcpMuxer::create(options, runner).await?),
        MergerKind::Concat => AnyMuxer::Concat(ConcatMuxer::create(options, runner)?),
        MergerKind::DownloadOnly => AnyMuxer::DownloadOnly(DownloadOnlyMuxer::create(options)),
    })
}

pub enum AnyMuxer {
    Tcp(TcpMuxer),
    Concat(ConcatMuxer),
    DownloadOnly(DownloadOnlyMuxer),
}

impl AnyMuxer {
    pub fn audio_merger(&self) -> Arc<dyn Merger> {
        match self {
            AnyMuxer::Tcp(m) => m.audio_merger(),
            AnyMuxer::Concat(m) => m.audio_merger(),
            AnyMuxer::DownloadOnly(m) => m.audio_merger(),
        }
    }

    pub fn video_merger(&self) -> Arc<dyn Merger> {
        match self {
            AnyMuxer::Tcp(m) => m.video_merger(),
            AnyMuxer::Concat(m) => m.video_merger(),
            AnyMuxer::DownloadOnly(m) => m.video_merger(),
        }
    }

    /// Produces the final output. The TCP muxer runs concurrently with its
    /// mergers and must be started as soon as the download begins; the others
    /// wait for their mergers internally.
    pub async fn mux(&self) -> Result<()> {
        match self {
            AnyMuxer::Tcp(m) => m.mux().await,
            AnyMuxer::Concat(m) => m.mux().await,
            AnyMuxer::DownloadOnly(m) => m.mux().await,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        match self {
            AnyMuxer::Tcp(m) => m.output_path(),
            AnyMuxer::Concat(m) => m.output_path(),
            AnyMuxer::DownloadOnly(m) => m.output_path(),
        }
    }
}

/// State shared by all merger task implementations. An ignored stream has no
/// `input`; its merger still drains the status feed so the pipeline ends.
pub(crate) struct TaskCommon {
    which: StreamKind,
    input: Option<String>,
    progress: Arc<MergeProgress>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl TaskCommon {
    fn new(which: StreamKind, input: Option<String>, progress: Arc<MergeProgress>) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        TaskCommon {
            which,
            input,
            progress,
            done_tx,
            done_rx,
        }
    }

    fn begin(&self, status: &SegmentStatus) {
        self.progress.init_total(status.total());
    }

    fn note_merged(&self) {
        self.progress.merged(self.which);
    }

    fn finish(&self) {
        let _ = self.done_tx.send(true);
    }

    async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

/// In-order polling over the status store: yields each segment result as it
/// becomes mergeable and `None` once everything was consumed. Sleeps with a
/// bounded linear backoff (1s, 2s, … capped at 10s) while the next index is
/// missing; there is no wake-up signal.
pub(crate) struct SegmentFeed<'a> {
    status: &'a SegmentStatus,
    misses: u64,
}

impl<'a> SegmentFeed<'a> {
    pub fn new(status: &'a SegmentStatus) -> Self {
        SegmentFeed { status, misses: 0 }
    }

    pub async fn next(&mut self) -> Option<SegmentResult> {
        loop {
            if self.status.done() {
                return None;
            }
            let (number, result) = self.status.next_to_merge();
            match result {
                Some(result) => {
                    self.misses = 0;
                    return Some(result);
                }
                None => {
                    tracing::debug!("waiting for segment {number} to be ready for merging");
                    tokio::time::sleep(Duration::from_secs(self.misses + 1)).await;
                    self.misses = (self.misses + 1).min(9);
                }
            }
        }
    }
}

/// Muxer stand-in for tests: always available, accepts any protocol, does
/// nothing on run.
#[cfg(test)]
pub(crate) struct NoopRunner;

#[cfg(test)]
#[async_trait]
impl ContainerMuxer for NoopRunner {
    async fn available(&self) -> Result<()> {
        Ok(())
    }

    async fn supports_protocol(&self, _name: &str) -> Result<bool> {
        Ok(true)
    }

    async fn run(&self, _audio: Option<&str>, _video: Option<&str>) -> Result<()> {
        Ok(())
    }
}

async fn delete_segment_files(files: &[PathBuf]) {
    for file in files {
        if let Err(e) = tokio::fs::remove_file(file).await {
            tracing::warn!("unable to delete segment file {}: {}", file.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::QueueMode;

    #[tokio::test]
    async fn feed_yields_in_order_and_ends() {
        let status = SegmentStatus::create(3, 1, QueueMode::Sequential, Duration::ZERO);
        status.downloaded(0, SegmentResult::done("a".into()));
        status.downloaded(1, SegmentResult::lost());
        status.downloaded(2, SegmentResult::done("c".into()));

        let mut feed = SegmentFeed::new(&status);
        assert_eq!(feed.next().await.unwrap().filename.unwrap(), PathBuf::from("a"));
        assert!(!feed.next().await.unwrap().ok);
        assert_eq!(feed.next().await.unwrap().filename.unwrap(), PathBuf::from("c"));
        assert!(feed.next().await.is_none());
    }

    #[tokio::test]
    async fn feed_on_empty_status_ends_immediately() {
        let status = SegmentStatus::create(0, 1, QueueMode::Sequential, Duration::ZERO);
        let mut feed = SegmentFeed::new(&status);
        assert!(feed.next().await.is_none());
    }

    #[test]
    fn merger_kind_parses() {
        assert_eq!("tcp".parse::<MergerKind>().unwrap(), MergerKind::Tcp);
        assert_eq!(
            "download-only".parse::<MergerKind>().unwrap(),
            MergerKind::DownloadOnly
        );
        assert!("mkv".parse::<MergerKind>().is_err());
    }
}
