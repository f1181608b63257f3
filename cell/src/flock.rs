//! A host-wide exclusive lock backed by `flock(2)` on a named file.

use crate::{Error, Result};
use fs2::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};
use tokio::sync::{Mutex, MutexGuard};

/// Serializes access to a host resource across tasks in this process and
/// across processes on the host.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    local: Mutex<()>,
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct FileLockGuard<'l> {
    _file: File,
    _local: MutexGuard<'l, ()>,
}

// === impl FileLock ===

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(&self) -> Result<FileLockGuard<'_>> {
        let local = self.local.lock().await;
        let path = self.path.clone();
        let file = tokio::task::spawn_blocking(move || lock_exclusive(&path))
            .await
            .map_err(std::io::Error::other)??;
        Ok(FileLockGuard {
            _file: file,
            _local: local,
        })
    }
}

/// Opens (creating if needed) and exclusively locks `path`, blocking until
/// the lock is available. The lock is released when the file is dropped.
pub fn lock_exclusive(path: &Path) -> Result<File> {
    let lock = |source| Error::Lock {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(lock)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)
        .map_err(lock)?;
    FileExt::lock_exclusive(&file).map_err(lock)?;
    Ok(file)
}

/// Runs `f` while holding the lock on `path`.
pub fn with_exclusive<T, E>(path: &Path, f: impl FnOnce() -> Result<T, E>) -> Result<T, E>
where
    E: From<Error>,
{
    let file = lock_exclusive(path)?;
    let out = f();
    drop(file);
    out
}
