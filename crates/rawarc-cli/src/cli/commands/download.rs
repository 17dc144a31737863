//! The download subcommand: wires the client pool, muxer and both download
//! pipelines together and runs them to completion.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use rawarc_core::config;
use rawarc_core::downloader::{DownloadResult, DownloadTask};
use rawarc_core::freg::FregJson;
use rawarc_core::merge::{create_muxer, ContainerMuxer, FfmpegMuxer, MergerKind, MuxerOptions};
use rawarc_core::net::{HttpClientConfig, HttpClientPool, IpPool, Network};
use rawarc_core::progress::{StreamKind, TotalProgress};
use rawarc_core::retry::RetryPolicy;
use rawarc_core::scheduler::QueueMode;
use rawarc_core::term::StatusSink;
use rawarc_core::url_model::ParsedUrl;

use super::super::{
    acquire_lock, init_logging, parse_merger_arguments, prepare_temp_dir, DownloadArgs,
};

fn warn_expiry(which: StreamKind, url: &ParsedUrl) {
    match url.is_expired() {
        Some(true) => tracing::warn!(
            "{which} URL is already expired ({}), downloads will likely fail",
            url.expire().map(|e| e.to_rfc3339()).unwrap_or_default()
        ),
        Some(false) => {}
        None => tracing::warn!("{which} URL carries no expire parameter"),
    }
}

fn report(which: &str, res: &DownloadResult) {
    if !res.lost_segments.is_empty() {
        tracing::warn!(
            "lost {} segment(s) {:?} out of {}",
            res.lost_segments.len(),
            res.lost_segments,
            res.total_segments
        );
    }
    match &res.error {
        Some(e) => tracing::error!("{which} download task failed: {e:#}"),
        None => tracing::info!("{which} download succeeded"),
    }
}

pub async fn run(args: DownloadArgs) -> Result<()> {
    let term = StatusSink::new();
    let cfg = config::load_or_init()?;
    init_logging(&term, &cfg.log_level, args.log_level.as_deref(), args.verbose)?;

    let freg = Arc::new(FregJson::from_file(&args.input)?);
    let output_base = freg
        .format_template(&args.output, true)
        .context("invalid output template")?;
    tracing::info!("saving output to {output_base}");
    term.set_window_name(&freg.metadata.title);

    let temp_dir = prepare_temp_dir(args.temp_dir.clone(), &freg.metadata.id)?;
    let _temp_lock = acquire_lock(
        &temp_dir.join(format!("{}.lock", freg.metadata.id)),
        "another instance is already downloading into this temp directory",
    )?;
    let _output_lock = acquire_lock(
        Path::new(&format!("{output_base}.lock")),
        "another instance is already writing to this output file",
    )?;

    let audio_url = ParsedUrl::parse(freg.best_audio(None)?)?;
    let video_url = ParsedUrl::parse(freg.best_video(None)?)?;
    warn_expiry(StreamKind::Audio, &audio_url);
    warn_expiry(StreamKind::Video, &video_url);

    let use_quic = args.use_quic.unwrap_or(cfg.use_quic);
    if use_quic && !cfg!(feature = "http3") {
        tracing::warn!("built without HTTP/3 support, falling back to HTTP/1.1/2");
    }
    let network = if args.ipv4 {
        Network::Ipv4
    } else if args.ipv6 {
        Network::Ipv6
    } else {
        Network::Any
    };
    let ip_pool = args.ip_pool.as_deref().map(IpPool::parse).transpose()?;
    let pool = HttpClientPool::new(HttpClientConfig {
        pool: ip_pool,
        network,
        use_quic,
    });

    let retry = RetryPolicy {
        fail_threshold: args.fail_threshold.unwrap_or(cfg.fail_threshold),
        connect_retries: args.connect_retries.unwrap_or(cfg.connect_retries),
        requeue_failed_max: args.requeue_failed.unwrap_or(cfg.requeue_failed),
        requeue_last: args.requeue_last || cfg.requeue_last,
        ..Default::default()
    };
    let requeue_delay = Duration::from_secs(args.requeue_delay.unwrap_or(cfg.requeue_delay_secs));
    let queue_mode: QueueMode = args.queue_mode.into();

    let runner: Arc<dyn ContainerMuxer> = Arc::new(FfmpegMuxer {
        final_file: PathBuf::from(format!("{output_base}.mkv")),
        freg: Arc::clone(&freg),
        temp_dir: temp_dir.clone(),
    });
    let options = MuxerOptions {
        delete_segments: !args.keep_files,
        disable_resume: args.disable_resume,
        final_file_base: output_base.clone(),
        freg: Arc::clone(&freg),
        overwrite_temp: args.overwrite_temp,
        temp_dir: temp_dir.clone(),
        ignore_audio: false,
        ignore_video: false,
        merger_args: parse_merger_arguments(&args.merger_arguments)?,
        term: Arc::clone(&term),
    };
    let muxer = Arc::new(create_muxer(args.merger.map(MergerKind::from), options, runner).await?);

    let progress = TotalProgress::new(Arc::clone(&term));
    let threads = args.threads.unwrap_or(cfg.threads).max(1);
    let fsync = args.fsync || cfg.fsync;

    let audio_task = DownloadTask {
        pool: Arc::clone(&pool),
        url: audio_url,
        threads,
        queue_mode,
        retry,
        requeue_delay,
        fsync,
        segment_dir: temp_dir.clone(),
        segment_count: args.segment_count,
        merger: muxer.audio_merger(),
        progress: progress.handle(StreamKind::Audio),
    };
    let video_task = DownloadTask {
        pool,
        url: video_url,
        threads,
        queue_mode,
        retry,
        requeue_delay,
        fsync,
        segment_dir: temp_dir.clone(),
        segment_count: args.segment_count,
        merger: muxer.video_merger(),
        progress: progress.handle(StreamKind::Video),
    };

    let audio_handle = audio_task.start();
    let video_handle = video_task.start();

    // start the muxer right away so the tcp merger can stream segments (and
    // delete them when resume is disabled) while downloads are running
    let mux_handle = {
        let muxer = Arc::clone(&muxer);
        tokio::spawn(async move { muxer.mux().await })
    };

    let audio_res = audio_handle.await.context("audio pipeline panicked")?;
    let video_res = video_handle.await.context("video pipeline panicked")?;
    report("audio", &audio_res);
    report("video", &video_res);

    tracing::info!("waiting for muxing to finish");
    mux_handle
        .await
        .context("muxer task panicked")?
        .context("muxing failed")?;

    if let Some(e) = audio_res.error {
        return Err(e.context("audio download failed"));
    }
    if let Some(e) = video_res.error {
        return Err(e.context("video download failed"));
    }

    tracing::info!("wrote {}", muxer.output_path().display());
    Ok(())
}
