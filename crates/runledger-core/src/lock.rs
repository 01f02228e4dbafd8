//! Host-level mutual exclusion for append-log writers.
//!
//! Multiple processes on one host may append concurrently; each append runs
//! inside an exclusive advisory lock on a dedicated lock file. Acquisition
//! is bounded by a deadline, release happens on every exit path via the RAII
//! guard, and the OS drops the lock if the holder dies.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

/// Diagnostic metadata written into the lock file by the current holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    /// Unix timestamp (seconds) when the lock was taken.
    pub acquired_at: u64,
    pub version: String,
}

impl LockMetadata {
    #[must_use]
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A named, scoped exclusive lock on a host-local file.
#[derive(Debug)]
pub struct HostLock {
    path: PathBuf,
    timeout: Duration,
}

/// Held lock; dropping it releases the advisory lock.
#[derive(Debug)]
pub struct HostLockGuard {
    file: File,
}

impl Drop for HostLockGuard {
    fn drop(&mut self) {
        // OS releases on process death regardless; explicit unlock keeps
        // the common path prompt.
        let _ = FileExt::unlock(&self.file);
    }
}

impl HostLock {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Acquire the lock, polling until the bounded deadline elapses.
    ///
    /// Returns `StoreError::Contention` when another holder keeps the lock
    /// past the deadline.
    pub fn acquire(&self) -> Result<HostLockGuard, StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Database(format!("lock dir: {e}")))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| StoreError::Database(format!("open lock file: {e}")))?;

        let deadline = Instant::now() + self.timeout;
        let mut waited = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if Instant::now() < deadline => {
                    waited = true;
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    return Err(StoreError::Contention(format!(
                        "lock {} not acquired within {:?}: {e}",
                        self.path.display(),
                        self.timeout
                    )));
                }
            }
        }
        if waited {
            debug!(path = %self.path.display(), "acquired host lock after waiting");
        }

        // Best effort; the lock itself is the advisory state.
        if let Ok(json) = serde_json::to_vec(&LockMetadata::current()) {
            let _ = file.set_len(0);
            let _ = file.write_all(&json);
            let _ = file.flush();
        }

        Ok(HostLockGuard { file })
    }
}
