//! Concat merger: appends segments into per-stream intermediate files and
//! runs the muxer once both streams are complete.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use super::{
    delete_segment_files, ContainerMuxer, MergeProgress, Merger, MuxerOptions, SegmentFeed,
    TaskCommon,
};
use crate::progress::StreamKind;
use crate::segfile::file_not_empty;
use crate::status::SegmentStatus;

pub struct ConcatMuxer {
    options: MuxerOptions,
    progress: Arc<MergeProgress>,
    audio: Arc<ConcatTask>,
    video: Arc<ConcatTask>,
    runner: Arc<dyn ContainerMuxer>,
}

impl ConcatMuxer {
    pub fn create(options: MuxerOptions, runner: Arc<dyn ContainerMuxer>) -> Result<Self> {
        let progress = MergeProgress::new(Arc::clone(&options.term));
        let audio = ConcatTask::create(&options, &progress, StreamKind::Audio)?;
        let video = ConcatTask::create(&options, &progress, StreamKind::Video)?;

        Ok(ConcatMuxer {
            options,
            progress,
            audio,
            video,
            runner,
        })
    }

    pub fn audio_merger(&self) -> Arc<dyn Merger> {
        Arc::clone(&self.audio) as Arc<dyn Merger>
    }

    pub fn video_merger(&self) -> Arc<dyn Merger> {
        Arc::clone(&self.video) as Arc<dyn Merger>
    }

    /// Waits for both intermediate files to be complete, then muxes them.
    pub async fn mux(&self) -> Result<()> {
        self.audio.wait().await;
        self.video.wait().await;

        self.runner
            .run(
                self.audio.common.input.as_deref(),
                self.video.common.input.as_deref(),
            )
            .await?;
        self.progress.done();

        tracing::debug!("mux succeeded, removing merged intermediate files");
        for task in [&self.audio, &self.video] {
            if let Some(target) = &task.target_file {
                if let Err(e) = tokio::fs::remove_file(target).await {
                    tracing::warn!("failed to remove {}: {}", target.display(), e);
                }
            }
        }

        if self.options.delete_segments {
            delete_segment_files(&self.audio.retained()).await;
            delete_segment_files(&self.video.retained()).await;
        }
        Ok(())
    }

    pub fn output_path(&self) -> PathBuf {
        PathBuf::from(format!("{}.mkv", self.options.final_file_base))
    }
}

struct ConcatTask {
    common: TaskCommon,
    delete_after_merge: bool,
    target_file: Option<PathBuf>,
    segments: Mutex<Vec<PathBuf>>,
}

impl ConcatTask {
    fn create(
        options: &MuxerOptions,
        progress: &Arc<MergeProgress>,
        which: StreamKind,
    ) -> Result<Arc<Self>> {
        let ignored = options.ignored(which);
        let mut target_file = None;
        let mut input = None;

        if !ignored {
            let file = options
                .temp_dir
                .join(format!("merged-{}.{which}", options.freg.metadata.id));
            if file_not_empty(&file) {
                if !options.overwrite_temp {
                    bail!(
                        "temporary merge file {} already exists and overwriting is disabled",
                        file.display()
                    );
                }
                std::fs::remove_file(&file).with_context(|| {
                    format!("unable to delete temporary file {}", file.display())
                })?;
            }
            input = Some(file.to_string_lossy().into_owned());
            target_file = Some(file);
        }

        Ok(Arc::new(ConcatTask {
            common: TaskCommon::new(which, input, Arc::clone(progress)),
            delete_after_merge: options.disable_resume,
            target_file,
            segments: Mutex::new(Vec::new()),
        }))
    }

    fn retained(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.segments.lock().unwrap())
    }

    async fn append_segment(&self, from: &Path, to: &Path) -> Result<()> {
        let mut input = tokio::fs::File::open(from)
            .await
            .with_context(|| format!("unable to open input file {}", from.display()))?;
        let mut output = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(to)
            .await
            .with_context(|| format!("unable to open output file {}", to.display()))?;
        tokio::io::copy(&mut input, &mut output)
            .await
            .with_context(|| format!("unable to append {}", from.display()))?;
        Ok(())
    }
}

#[async_trait]
impl Merger for ConcatTask {
    async fn merge(&self, status: Arc<SegmentStatus>) {
        self.common.begin(&status);

        let mut feed = SegmentFeed::new(&status);
        while let Some(result) = feed.next().await {
            if let Some(target) = self.target_file.as_ref().filter(|_| result.ok) {
                if let Some(filename) = &result.filename {
                    match self.append_segment(filename, target).await {
                        Ok(()) => {
                            if self.delete_after_merge {
                                let _ = tokio::fs::remove_file(filename).await;
                            } else {
                                self.segments.lock().unwrap().push(filename.clone());
                            }
                        }
                        Err(e) => tracing::error!(
                            "unable to merge file '{}' into '{}': {e:#}",
                            filename.display(),
                            target.display()
                        ),
                    }
                }
            }
            self.common.note_merged();
        }

        self.common.finish();
    }

    async fn wait(&self) {
        self.common.wait().await;
    }

    fn muxer_input(&self) -> Option<String> {
        self.common.input.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freg::FregJson;
    use crate::scheduler::QueueMode;
    use crate::status::SegmentResult;
    use crate::term::StatusSink;
    use std::collections::HashMap;
    use std::time::Duration;

    fn sample_freg() -> Arc<FregJson> {
        let json = r#"{
            "video": { "299": "https://example.com/v" },
            "audio": { "140": "https://example.com/a" },
            "metadata": {
                "title": "t", "id": "vid", "channelName": "c",
                "channelURL": "https://www.youtube.com/channel/UCx",
                "startTimestamp": "2021-06-05T12:30:00Z"
            },
            "createTime": "2021-06-05T15:00:00Z"
        }"#;
        Arc::new(serde_json::from_str(json).unwrap())
    }

    use crate::merge::NoopRunner;

    fn options(dir: &Path) -> MuxerOptions {
        MuxerOptions {
            delete_segments: false,
            disable_resume: false,
            final_file_base: dir.join("out").to_string_lossy().into_owned(),
            freg: sample_freg(),
            overwrite_temp: false,
            temp_dir: dir.to_path_buf(),
            ignore_audio: false,
            ignore_video: true,
            merger_args: HashMap::new(),
            term: StatusSink::new(),
        }
    }

    #[tokio::test]
    async fn concatenates_ok_segments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (i, body) in [b"one-".as_slice(), b"two-", b"three"].iter().enumerate() {
            std::fs::write(dir.path().join(format!("seg{i}")), body).unwrap();
        }

        let muxer = ConcatMuxer::create(options(dir.path()), Arc::new(NoopRunner)).unwrap();
        let status = SegmentStatus::create(4, 1, QueueMode::Sequential, Duration::ZERO);
        status.downloaded(0, SegmentResult::done(dir.path().join("seg0")));
        status.downloaded(1, SegmentResult::done(dir.path().join("seg1")));
        status.downloaded(2, SegmentResult::lost());
        status.downloaded(3, SegmentResult::done(dir.path().join("seg2")));

        muxer.audio_merger().merge(status).await;

        let merged = dir.path().join("merged-vid.audio");
        assert_eq!(std::fs::read(&merged).unwrap(), b"one-two-three");
    }

    #[tokio::test]
    async fn pre_existing_intermediate_file_fails_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("merged-vid.audio"), b"stale").unwrap();

        let err = ConcatMuxer::create(options(dir.path()), Arc::new(NoopRunner))
            .err()
            .unwrap();
        assert!(err.to_string().contains("already exists"));

        let mut opts = options(dir.path());
        opts.overwrite_temp = true;
        let muxer = ConcatMuxer::create(opts, Arc::new(NoopRunner)).unwrap();
        assert!(!dir.path().join("merged-vid.audio").exists());
        drop(muxer);
    }

    #[tokio::test]
    async fn mux_removes_intermediate_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("seg0"), b"data").unwrap();

        let muxer = ConcatMuxer::create(options(dir.path()), Arc::new(NoopRunner)).unwrap();
        let status = SegmentStatus::create(1, 1, QueueMode::Sequential, Duration::ZERO);
        status.downloaded(0, SegmentResult::done(dir.path().join("seg0")));

        let audio = muxer.audio_merger();
        let video = muxer.video_merger();
        let video_status = SegmentStatus::create(0, 1, QueueMode::Sequential, Duration::ZERO);
        tokio::join!(audio.merge(status), video.merge(video_status));

        muxer.mux().await.unwrap();
        assert!(!dir.path().join("merged-vid.audio").exists());
    }
}
