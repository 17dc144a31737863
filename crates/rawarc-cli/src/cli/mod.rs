mod commands;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};

use rawarc_core::lockfile::{LockError, LockFile};
use rawarc_core::logging;
use rawarc_core::merge::MergerKind;
use rawarc_core::scheduler::QueueMode;
use rawarc_core::term::StatusSink;

const DEFAULT_OUTPUT_FORMAT: &str = "%(upload_date)s %(title)s (%(id)s)";

const AFTER_HELP: &str = "\
Examples:
    rawarc download -i dQw4w9WgXcQ.urls.json
    rawarc download --threads 12 -i WTf8-KT6fWA.urls.json
    rawarc download -o '[%(upload_date)s] %(title)s (%(id)s)' -i 5gDw5AWN-Kk.urls.json
    rawarc download --merger-argument tcp:bind_address=127.69.4.20 -i fvO2NFDIEgk.urls.json
    rawarc merge -i '20210605 stream (id).json'

Format template keys (youtube-dl style, sanitized for file names):
    id, url, title, description, channel, channel_id, channel_url,
    upload_date, start_date, publish_date (YYYYMMDD, UTC),
    start_timestamp (RFC 3339)

    The description, url and channel_url keys substitute to nothing in
    file names.

Resuming:
    Downloads resume as long as temporary files are kept (--keep-files)
    and the same temp directory is used for both runs.";

/// Archives live streams from pre-signed per-segment media URLs.
#[derive(Debug, Parser)]
#[command(name = "rawarc", version, after_help = AFTER_HELP)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download both elementary streams and mux the final container.
    Download(DownloadArgs),
    /// Re-run a merger over the JSON written by the download-only merger.
    Merge(MergeArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum QueueModeArg {
    Sequential,
    OutOfOrder,
    Auto,
}

impl From<QueueModeArg> for QueueMode {
    fn from(mode: QueueModeArg) -> Self {
        match mode {
            QueueModeArg::Sequential => QueueMode::Sequential,
            QueueModeArg::OutOfOrder => QueueMode::OutOfOrder,
            QueueModeArg::Auto => QueueMode::Auto,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum MergerArg {
    Tcp,
    Concat,
    DownloadOnly,
}

impl From<MergerArg> for MergerKind {
    fn from(merger: MergerArg) -> Self {
        match merger {
            MergerArg::Tcp => MergerKind::Tcp,
            MergerArg::Concat => MergerKind::Concat,
            MergerArg::DownloadOnly => MergerKind::DownloadOnly,
        }
    }
}

#[derive(Debug, Args)]
struct DownloadArgs {
    /// Input descriptor JSON file.
    #[arg(short, long)]
    input: PathBuf,

    /// Output name excluding the extension; supports %(key)s substitution.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_FORMAT)]
    output: String,

    /// Download threads per stream.
    #[arg(short, long)]
    threads: Option<usize>,

    /// Times to retry a request on connection failure.
    #[arg(long)]
    connect_retries: Option<u32>,

    /// Times to retry downloading a segment on failure.
    #[arg(long = "retries")]
    fail_threshold: Option<u32>,

    /// Times a segment that exhausted its retries is requeued.
    #[arg(long)]
    requeue_failed: Option<u32>,

    /// Seconds a requeued segment waits before its next attempt.
    #[arg(long)]
    requeue_delay: Option<u64>,

    /// Allow requeueing the final segment (usually pointless for live tails).
    #[arg(long)]
    requeue_last: bool,

    /// Order to download segments in.
    #[arg(short, long, value_enum, default_value_t = QueueModeArg::Sequential)]
    queue_mode: QueueModeArg,

    /// Do not delete temporary files after a successful mux.
    #[arg(short = 'k', long)]
    keep_files: bool,

    /// Delete each segment file right after it is merged. Disables resume.
    #[arg(long)]
    disable_resume: bool,

    /// Directory for segments and merge temporaries; a per-stream directory
    /// under the system temp dir is used when unset.
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Whether HTTP/3 should be used (requires an http3-enabled build).
    #[arg(long)]
    use_quic: Option<bool>,

    /// Overwrite temporary merge files instead of failing.
    #[arg(short = 'O', long)]
    overwrite_temp: bool,

    /// fsync segment files after writing.
    #[arg(long)]
    fsync: bool,

    /// Merger backend; the best supported one is picked when unset.
    #[arg(long, value_enum)]
    merger: Option<MergerArg>,

    /// Merger argument as NAME:KEY=VALUE (e.g. tcp:bind_address=127.0.0.1).
    #[arg(long = "merger-argument")]
    merger_arguments: Vec<String>,

    /// Bind requests to any IPv4 address.
    #[arg(long, conflicts_with_all = ["ipv6", "ip_pool"])]
    ipv4: bool,

    /// Bind requests to any IPv6 address.
    #[arg(long, conflicts_with = "ip_pool")]
    ipv6: bool,

    /// File with one local IP per line; each requester binds to a random one.
    #[arg(long)]
    ip_pool: Option<PathBuf>,

    /// Segment count override; 0 discovers it from the stream.
    #[arg(long, default_value_t = 0)]
    segment_count: usize,

    /// Log level (debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Debug logging; overrides log-level.
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// JSON file written by a download-only run.
    #[arg(short, long)]
    input: PathBuf,

    /// Output name excluding the extension; supports %(key)s substitution.
    #[arg(short, long, default_value = DEFAULT_OUTPUT_FORMAT)]
    output: String,

    /// Merger backend; the best supported one is picked when unset.
    #[arg(long, value_enum)]
    merger: Option<MergerArg>,

    /// Merger argument as NAME:KEY=VALUE.
    #[arg(long = "merger-argument")]
    merger_arguments: Vec<String>,

    /// Directory for merge temporaries.
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Overwrite temporary merge files instead of failing.
    #[arg(short = 'O', long)]
    overwrite_temp: bool,

    /// Do not delete segment files after a successful mux.
    #[arg(short = 'k', long)]
    keep_files: bool,

    /// Log level (debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Debug logging; overrides log-level.
    #[arg(short, long)]
    verbose: bool,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Download(args) => commands::download::run(args).await,
        Command::Merge(args) => commands::merge::run(args).await,
    }
}

fn init_logging(
    term: &Arc<StatusSink>,
    cfg_level: &str,
    flag_level: Option<&str>,
    verbose: bool,
) -> Result<()> {
    let level = if verbose {
        "debug"
    } else {
        flag_level.unwrap_or(cfg_level)
    };
    logging::init(level, Arc::clone(term))
}

fn parse_merger_arguments(list: &[String]) -> Result<HashMap<String, HashMap<String, String>>> {
    let mut out: HashMap<String, HashMap<String, String>> = HashMap::new();
    for raw in list {
        let (name, kv) = raw
            .split_once(':')
            .with_context(|| format!("invalid merger argument '{raw}', format is NAME:KEY=VALUE"))?;
        let (key, value) = kv
            .split_once('=')
            .with_context(|| format!("invalid merger argument '{raw}', format is NAME:KEY=VALUE"))?;
        out.entry(name.to_ascii_lowercase())
            .or_default()
            .insert(key.to_ascii_lowercase(), value.to_string());
    }
    Ok(out)
}

fn prepare_temp_dir(requested: Option<PathBuf>, id: &str) -> Result<PathBuf> {
    let dir = match requested {
        Some(dir) => dir,
        None => {
            let dir = std::env::temp_dir().join(format!("rawarc-{id}"));
            tracing::info!("storing temporary files in {}", dir.display());
            dir
        }
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("unable to create temp dir at '{}'", dir.display()))?;
    Ok(dir)
}

fn acquire_lock(path: &Path, diagnostic: &str) -> Result<LockFile> {
    match LockFile::acquire(path) {
        Ok(lock) => Ok(lock),
        Err(e @ LockError::Held(_)) => {
            tracing::error!("{diagnostic}");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merger_arguments_parse_into_nested_maps() {
        let args = vec![
            "tcp:bind_address=127.69.4.20".to_string(),
            "TCP:other=a=b:c".to_string(),
        ];
        let parsed = parse_merger_arguments(&args).unwrap();
        assert_eq!(parsed["tcp"]["bind_address"], "127.69.4.20");
        // only the first ':' and '=' are separators
        assert_eq!(parsed["tcp"]["other"], "a=b:c");
    }

    #[test]
    fn malformed_merger_arguments_are_rejected() {
        assert!(parse_merger_arguments(&["tcp-bind".to_string()]).is_err());
        assert!(parse_merger_arguments(&["tcp:bind".to_string()]).is_err());
    }

    #[test]
    fn cli_parses_a_download_invocation() {
        let cli = Cli::try_parse_from([
            "rawarc",
            "download",
            "--input",
            "stream.urls.json",
            "--threads",
            "12",
            "--queue-mode",
            "out-of-order",
            "--merger",
            "download-only",
        ])
        .unwrap();
        match cli.command {
            Command::Download(args) => {
                assert_eq!(args.threads, Some(12));
                assert_eq!(args.queue_mode, QueueModeArg::OutOfOrder);
                assert_eq!(args.merger, Some(MergerArg::DownloadOnly));
            }
            _ => panic!("expected download subcommand"),
        }
    }

    #[test]
    fn ip_flags_conflict() {
        assert!(Cli::try_parse_from([
            "rawarc", "download", "--input", "x.json", "--ipv4", "--ipv6"
        ])
        .is_err());
    }
}
