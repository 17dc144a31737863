//! TCP merger: streams segments to the muxer over a loopback socket.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use super::{
    delete_segment_files, ContainerMuxer, MergeProgress, Merger, MuxerOptions, SegmentFeed,
    TaskCommon,
};
use crate::progress::StreamKind;
use crate::status::SegmentStatus;

pub struct TcpMuxer {
    options: MuxerOptions,
    progress: Arc<MergeProgress>,
    audio: Arc<TcpTask>,
    video: Arc<TcpTask>,
    runner: Arc<dyn ContainerMuxer>,
}

impl TcpMuxer {
    pub async fn create(options: MuxerOptions, runner: Arc<dyn ContainerMuxer>) -> Result<Self> {
        let bind_address: IpAddr = match options.merger_argument("tcp", "bind_address") {
            Some(addr) => addr
                .parse()
                .with_context(|| format!("invalid ip address '{addr}'"))?,
            None => IpAddr::from([127, 0, 0, 1]),
        };

        let progress = MergeProgress::new(Arc::clone(&options.term));
        let audio = TcpTask::create(bind_address, &options, &progress, StreamKind::Audio).await?;
        let video = TcpTask::create(bind_address, &options, &progress, StreamKind::Video).await?;

        Ok(TcpMuxer {
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

    /// Runs the muxer; it connects back to the listeners and receives the
    /// streams while the mergers are still consuming segments.
    pub async fn mux(&self) -> Result<()> {
        self.runner
            .run(
                self.audio.common.input.as_deref(),
                self.video.common.input.as_deref(),
            )
            .await?;
        self.progress.done();

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

struct TcpTask {
    common: TaskCommon,
    delete_after_merge: bool,
    listener: Mutex<Option<TcpListener>>,
    segments: Mutex<Vec<PathBuf>>,
}

impl TcpTask {
    async fn create(
        bind_address: IpAddr,
        options: &MuxerOptions,
        progress: &Arc<MergeProgress>,
        which: StreamKind,
    ) -> Result<Arc<Self>> {
        let ignored = options.ignored(which);
        let mut listener = None;
        let mut input = None;

        if !ignored {
            let l = TcpListener::bind((bind_address, 0))
                .await
                .context("unable to start listening")?;
            let addr = l.local_addr().context("listener has no local address")?;
            tracing::debug!("{which} merger listening on {addr}");
            input = Some(format!("tcp://{addr}"));
            listener = Some(l);
        }

        Ok(Arc::new(TcpTask {
            common: TaskCommon::new(which, input, Arc::clone(progress)),
            delete_after_merge: options.disable_resume,
            listener: Mutex::new(listener),
            segments: Mutex::new(Vec::new()),
        }))
    }

    fn retained(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.segments.lock().unwrap())
    }

    async fn send_segments(&self, status: &SegmentStatus, conn: &mut TcpStream) {
        let mut feed = SegmentFeed::new(status);
        while let Some(result) = feed.next().await {
            if result.ok {
                if let Some(filename) = &result.filename {
                    match send_file(filename, conn).await {
                        Ok(()) => {
                            if self.delete_after_merge {
                                let _ = tokio::fs::remove_file(filename).await;
                            } else {
                                self.segments.lock().unwrap().push(filename.clone());
                            }
                        }
                        Err(e) => tracing::error!(
                            "unable to send file '{}' to muxer: {e:#}",
                            filename.display()
                        ),
                    }
                }
            }
            self.common.note_merged();
        }
    }
}

async fn send_file(path: &std::path::Path, conn: &mut TcpStream) -> Result<()> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("unable to open {}", path.display()))?;
    tokio::io::copy(&mut file, conn)
        .await
        .with_context(|| format!("unable to stream {}", path.display()))?;
    Ok(())
}

#[async_trait]
impl Merger for TcpTask {
    async fn merge(&self, status: Arc<SegmentStatus>) {
        self.common.begin(&status);

        let listener = self.listener.lock().unwrap().take();
        match listener {
            None => {
                // ignored stream: still consume the feed so the pipeline ends
                let mut feed = SegmentFeed::new(&status);
                while feed.next().await.is_some() {
                    self.common.note_merged();
                }
            }
            Some(listener) => match listener.accept().await {
                Ok((mut conn, _)) => {
                    tracing::info!("got connection");
                    self.send_segments(&status, &mut conn).await;
                }
                Err(e) => tracing::error!("unable to accept connection: {e}"),
            },
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
    use tokio::io::AsyncReadExt;

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

    fn options(dir: &std::path::Path) -> MuxerOptions {
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
    async fn streams_segments_in_order_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        for (i, body) in [b"aaa".as_slice(), b"bb", b"c"].iter().enumerate() {
            std::fs::write(dir.path().join(format!("seg{i}")), body).unwrap();
        }

        let muxer = TcpMuxer::create(options(dir.path()), Arc::new(NoopRunner))
            .await
            .unwrap();
        let input = muxer.audio.common.input.clone().unwrap();
        let addr = input.strip_prefix("tcp://").unwrap().to_string();

        let status = SegmentStatus::create(3, 1, QueueMode::Sequential, Duration::ZERO);
        for i in 0..3 {
            status.downloaded(i, SegmentResult::done(dir.path().join(format!("seg{i}"))));
        }

        let merger = muxer.audio_merger();
        let status_for_merge = Arc::clone(&status);
        let merge_task = tokio::spawn(async move { merger.merge(status_for_merge).await });

        let mut conn = TcpStream::connect(&addr).await.unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"aaabbc");

        merge_task.await.unwrap();
        muxer.audio.wait().await;
    }

    #[tokio::test]
    async fn ignored_stream_has_no_listener_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = TcpMuxer::create(options(dir.path()), Arc::new(NoopRunner))
            .await
            .unwrap();
        assert!(muxer.video.common.input.is_none());

        let status = SegmentStatus::create(0, 1, QueueMode::Sequential, Duration::ZERO);
        muxer.video_merger().merge(status).await;
        muxer.video.wait().await;
    }

    #[tokio::test]
    async fn invalid_bind_address_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.merger_args.insert(
            "tcp".to_string(),
            HashMap::from([("bind_address".to_string(), "not-an-ip".to_string())]),
        );
        assert!(TcpMuxer::create(opts, Arc::new(NoopRunner)).await.is_err());
    }
}
