//! External ffmpeg invocation.
//!
//! The container assembly runs in a subprocess; this module only builds the
//! byte inputs and command line, it never touches media data itself. The
//! `ContainerMuxer` trait is the seam tests use to substitute a sink.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::Instrument;

use crate::freg::FregJson;

/// The external container assembler: probing for support and one mux run.
#[async_trait]
pub trait ContainerMuxer: Send + Sync {
    /// Errors when the muxer binary is unavailable.
    async fn available(&self) -> Result<()>;

    /// Whether the muxer supports reading inputs over `name` (tcp, file, …).
    async fn supports_protocol(&self, name: &str) -> Result<bool>;

    /// Assembles the final container from the given inputs. `None` inputs
    /// belong to ignored streams.
    async fn run(&self, audio: Option<&str>, video: Option<&str>) -> Result<()>;
}

/// Stderr lines that are known noise and not worth surfacing.
const IGNORED_WARNINGS: &[&str] = &[
    "    Last message repeated ",
    "Found duplicated MOOV Atom. Skipped it",
    "Found unknown-length element with ID 0x18538067 at pos.",
];

pub struct FfmpegMuxer {
    pub final_file: PathBuf,
    pub freg: Arc<FregJson>,
    pub temp_dir: PathBuf,
}

fn ffmpeg(args: &[&str]) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-v").arg("warning").args(args);
    cmd.stdin(Stdio::null());
    cmd
}

impl FfmpegMuxer {
    async fn mux(&self, audio: Option<&str>, video: Option<&str>) -> Result<()> {
        let mut args: Vec<&str> = vec!["-y"];
        for input in [audio, video].into_iter().flatten() {
            args.push("-i");
            args.push(input);
        }
        if args.len() == 1 {
            bail!("both streams are ignored, nothing to mux");
        }
        args.push("-c");
        args.push("copy");

        let thumbnail = self.temp_dir.join(format!(
            "thumbnail-{}.jpg",
            self.freg.metadata.id
        ));
        self.freg
            .write_thumbnail(&thumbnail)
            .context("unable to write thumbnail file")?;

        let meta = &self.freg.metadata;
        let title = format!("title={}", meta.title);
        let comment = format!("comment={}", meta.description);
        let author = format!("author={}", meta.channel_name);
        let episode = format!("episode_id={}", meta.id);
        let thumbnail_arg = thumbnail.to_string_lossy().into_owned();
        args.extend_from_slice(&[
            "-metadata",
            &title,
            "-metadata",
            &comment,
            "-metadata",
            &author,
            "-metadata",
            &episode,
            "-attach",
            &thumbnail_arg,
            "-metadata:s:t",
            "mimetype=image/jpeg",
            "-metadata:s:t",
            "filename=thumbnail.jpg",
        ]);
        let final_file = self.final_file.to_string_lossy().into_owned();
        args.push(&final_file);

        tracing::debug!("ffmpeg command: {args:?}");
        let output = ffmpeg(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("unable to run ffmpeg")?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            bail!("ffmpeg exited with {}: {}", output.status, stderr.trim());
        }

        let warnings: Vec<&str> = stderr
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.is_empty() && !ignore_warning(l))
            .collect();
        if !warnings.is_empty() {
            tracing::warn!("ffmpeg succeeded with warnings");
            for w in warnings {
                tracing::warn!("{w}");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerMuxer for FfmpegMuxer {
    async fn available(&self) -> Result<()> {
        let status = ffmpeg(&["-h"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .context("unable to find FFmpeg")?;
        if !status.success() {
            bail!("ffmpeg -h exited with {status}");
        }
        Ok(())
    }

    async fn supports_protocol(&self, name: &str) -> Result<bool> {
        let arg = format!("protocol={name}");
        let output = ffmpeg(&["--help", &arg])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await
            .context("unable to find FFmpeg")?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(!stdout.contains("Unknown protocol"))
    }

    async fn run(&self, audio: Option<&str>, video: Option<&str>) -> Result<()> {
        self.mux(audio, video)
            .instrument(tracing::info_span!("muxer"))
            .await
    }
}

fn ignore_warning(line: &str) -> bool {
    IGNORED_WARNINGS.iter().any(|w| line.contains(w))
}
