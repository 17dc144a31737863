//! The merge subcommand: replays a download-only record through a real
//! merger without touching the network.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use rawarc_core::config;
use rawarc_core::merge::{
    merge_download_info, ContainerMuxer, DownloadJson, FfmpegMuxer, MergerKind, MuxerOptions,
};
use rawarc_core::term::StatusSink;

use super::super::{acquire_lock, init_logging, parse_merger_arguments, prepare_temp_dir, MergeArgs};

pub async fn run(args: MergeArgs) -> Result<()> {
    let term = StatusSink::new();
    let cfg = config::load_or_init()?;
    init_logging(&term, &cfg.log_level, args.log_level.as_deref(), args.verbose)?;

    let info = DownloadJson::from_file(&args.input)?;
    let freg = Arc::new(info.freg_data.clone());
    let output_base = freg
        .format_template(&args.output, true)
        .context("invalid output template")?;
    tracing::info!("saving output to {output_base}");
    term.set_window_name(&freg.metadata.title);

    let temp_dir = prepare_temp_dir(args.temp_dir.clone(), &freg.metadata.id)?;
    let _output_lock = acquire_lock(
        Path::new(&format!("{output_base}.lock")),
        "another instance is already writing to this output file",
    )?;

    let runner: Arc<dyn ContainerMuxer> = Arc::new(FfmpegMuxer {
        final_file: PathBuf::from(format!("{output_base}.mkv")),
        freg: Arc::clone(&freg),
        temp_dir: temp_dir.clone(),
    });
    let options = MuxerOptions {
        delete_segments: !args.keep_files,
        disable_resume: false,
        final_file_base: output_base,
        freg,
        overwrite_temp: args.overwrite_temp,
        temp_dir,
        ignore_audio: false,
        ignore_video: false,
        merger_args: parse_merger_arguments(&args.merger_arguments)?,
        term,
    };

    let output = merge_download_info(info, args.merger.map(MergerKind::from), options, runner)
        .await
        .context("merge failed")?;
    tracing::info!("wrote {}", output.display());
    Ok(())
}
