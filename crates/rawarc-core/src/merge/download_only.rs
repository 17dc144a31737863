//! Download-only merger: records per-stream results into a JSON document
//! that can later be replayed through a real merger without re-downloading.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    create_muxer, ContainerMuxer, MergeProgress, Merger, MergerKind, MuxerOptions, SegmentFeed,
    TaskCommon,
};
use crate::freg::FregJson;
use crate::progress::StreamKind;
use crate::scheduler::QueueMode;
use crate::status::{SegmentResult, SegmentStatus};

/// The replayable download record. `None` stream entries mean the stream was
/// ignored during the download.
#[derive(Debug, Serialize, Deserialize)]
pub struct DownloadJson {
    #[serde(rename = "FregData")]
    pub freg_data: FregJson,
    #[serde(rename = "AudioSegments")]
    pub audio_segments: Option<Vec<SegmentResult>>,
    #[serde(rename = "VideoSegments")]
    pub video_segments: Option<Vec<SegmentResult>>,
}

impl DownloadJson {
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read '{}'", path.display()))?;
        serde_json::from_str(&data).context(
            "unable to parse json (is it a file created by the download-only merger?)",
        )
    }
}

pub struct DownloadOnlyMuxer {
    options: MuxerOptions,
    progress: Arc<MergeProgress>,
    audio: Arc<DownloadOnlyTask>,
    video: Arc<DownloadOnlyTask>,
}

impl DownloadOnlyMuxer {
    pub fn create(options: MuxerOptions) -> Self {
        let progress = MergeProgress::new(Arc::clone(&options.term));
        let audio = DownloadOnlyTask::create(&progress, StreamKind::Audio);
        let video = DownloadOnlyTask::create(&progress, StreamKind::Video);
        DownloadOnlyMuxer {
            options,
            progress,
            audio,
            video,
        }
    }

    pub fn audio_merger(&self) -> Arc<dyn Merger> {
        Arc::clone(&self.audio) as Arc<dyn Merger>
    }

    pub fn video_merger(&self) -> Arc<dyn Merger> {
        Arc::clone(&self.video) as Arc<dyn Merger>
    }

    /// Waits for both streams and writes the record next to where the final
    /// container would have gone.
    pub async fn mux(&self) -> Result<()> {
        self.audio.wait().await;
        self.video.wait().await;
        self.progress.done();

        let doc = DownloadJson {
            freg_data: self.options.freg.as_ref().clone(),
            audio_segments: (!self.options.ignore_audio).then(|| self.audio.collected()),
            video_segments: (!self.options.ignore_video).then(|| self.video.collected()),
        };

        let json = serde_json::to_vec(&doc).context("unable to serialize download record")?;
        let path = self.output_path();
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("unable to write {}", path.display()))?;
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.json", self.options.final_file_base))
    }
}

struct DownloadOnlyTask {
    common: TaskCommon,
    segments: Mutex<Vec<SegmentResult>>,
}

impl DownloadOnlyTask {
    fn create(progress: &Arc<MergeProgress>, which: StreamKind) -> Arc<Self> {
        Arc::new(DownloadOnlyTask {
            common: TaskCommon::new(which, None, Arc::clone(progress)),
            segments: Mutex::new(Vec::new()),
        })
    }

    fn collected(&self) -> Vec<SegmentResult> {
        self.segments.lock().unwrap().clone()
    }
}

#[async_trait]
impl Merger for DownloadOnlyTask {
    async fn merge(&self, status: Arc<SegmentStatus>) {
        self.common.begin(&status);

        let mut feed = SegmentFeed::new(&status);
        while let Some(result) = feed.next().await {
            self.segments.lock().unwrap().push(result);
            self.common.note_merged();
        }

        self.common.finish();
    }

    async fn wait(&self) {
        self.common.wait().await;
    }

    fn muxer_input(&self) -> Option<String> {
        None
    }
}

/// Replays recorded results through a merger: a single-worker sequential
/// status store is filled in order while the merger consumes it.
pub fn feed_merger(merger: Arc<dyn Merger>, data: Vec<SegmentResult>) {
    let status = SegmentStatus::create(data.len(), 1, QueueMode::Sequential, Duration::ZERO);
    {
        let merger = Arc::clone(&merger);
        let status = Arc::clone(&status);
        tokio::spawn(async move { merger.merge(status).await });
    }
    for (index, result) in data.into_iter().enumerate() {
        status.downloaded(index, result);
    }
}

/// Merge-only mode: run a real muxer over the segments recorded by a prior
/// download-only run.
pub async fn merge_download_info(
    info: DownloadJson,
    kind: Option<MergerKind>,
    mut options: MuxerOptions,
    runner: Arc<dyn ContainerMuxer>,
) -> Result<PathBuf> {
    if kind == Some(MergerKind::DownloadOnly) {
        bail!("download-only is not a valid merger for merge mode");
    }

    options.freg = Arc::new(info.freg_data);
    options.ignore_audio = info.audio_segments.is_none();
    options.ignore_video = info.video_segments.is_none();

    let muxer = create_muxer(kind, options, runner).await?;
    feed_merger(muxer.audio_merger(), info.audio_segments.unwrap_or_default());
    feed_merger(muxer.video_merger(), info.video_segments.unwrap_or_default());

    muxer.mux().await?;
    Ok(muxer.output_path())
}
