//! Cooperative exclusion on temp and output paths.
//!
//! Advisory lock files keep two instances from writing into the same segment
//! directory or output file. Contention is reported with a specific
//! diagnostic and is fatal; the lock file is removed on drop.

use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;

#[derive(Debug)]
pub enum LockError {
    /// Another process holds the lock.
    Held(PathBuf),
    Io(PathBuf, io::Error),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Held(path) => {
                write!(f, "another instance is already using {}", path.display())
            }
            LockError::Io(path, e) => write!(f, "unable to lock {}: {}", path.display(), e),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Held(_) => None,
            LockError::Io(_, e) => Some(e),
        }
    }
}

/// A held advisory lock. Released (and the file removed) on drop.
pub struct LockFile {
    file: File,
    path: PathBuf,
}

impl LockFile {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(|e| LockError::Io(path.to_path_buf(), e))?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(LockFile {
                file,
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                Err(LockError::Held(path.to_path_buf()))
            }
            Err(e) => Err(LockError::Io(path.to_path_buf(), e)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = std::fs::remove_file(&self.path);
    }
}
