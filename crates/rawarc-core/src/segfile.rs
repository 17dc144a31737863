//! Atomic segment file I/O.
//!
//! Segments live in exactly two on-disk states: `<base>.incomplete` while the
//! body is being streamed, and `<base>.done` after a successful rename. Only
//! `.done` files are ever read back, which is what makes resuming from a
//! previous run safe.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::net::TrackedResponse;

/// True when `path` exists and has a non-zero size.
pub fn file_not_empty(path: &Path) -> bool {
    matches!(std::fs::metadata(path), Ok(m) if m.len() > 0)
}

/// Naming and write logic for one segment's files.
pub struct SegmentFile {
    base: PathBuf,
}

impl SegmentFile {
    pub fn new(dir: &Path, id: &str, itag: i32, segment: usize) -> Self {
        SegmentFile {
            base: dir.join(format!("segment-{id}_{itag}.{segment}")),
        }
    }

    pub fn done_path(&self) -> PathBuf {
        with_suffix(&self.base, ".done")
    }

    pub fn incomplete_path(&self) -> PathBuf {
        with_suffix(&self.base, ".incomplete")
    }

    /// Returns the `.done` path when a complete segment from a previous run
    /// can be reused.
    pub fn cached(&self) -> Option<PathBuf> {
        let done = self.done_path();
        file_not_empty(&done).then_some(done)
    }

    /// Streams the response body into the `.incomplete` file, optionally
    /// fsyncs, then atomically renames to `.done`. Any failure removes the
    /// partial file.
    pub async fn write(&self, response: &mut TrackedResponse, fsync: bool) -> Result<PathBuf> {
        let incomplete = self.incomplete_path();
        let done = self.done_path();

        let result = self.write_inner(&incomplete, &done, response, fsync).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&incomplete).await;
        }
        result
    }

    async fn write_inner(
        &self,
        incomplete: &Path,
        done: &Path,
        response: &mut TrackedResponse,
        fsync: bool,
    ) -> Result<PathBuf> {
        let mut file = tokio::fs::File::create(incomplete)
            .await
            .with_context(|| format!("unable to create {}", incomplete.display()))?;

        while let Some(chunk) = response
            .chunk()
            .await
            .context("segment body read failed")?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("unable to write {}", incomplete.display()))?;
        }

        if fsync {
            file.sync_all()
                .await
                .with_context(|| format!("fsync of {} failed", incomplete.display()))?;
        }
        drop(file);

        tokio::fs::rename(incomplete, done)
            .await
            .with_context(|| format!("unable to rename {} to {}", incomplete.display(), done.display()))?;
        Ok(done.to_path_buf())
    }
}

// `Path::with_extension` would eat the segment number ("….3" looks like an
// extension), so the suffix is appended to the full base name instead.
fn with_suffix(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}
