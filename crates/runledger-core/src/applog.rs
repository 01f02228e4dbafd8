//! Append-only replay log, the ground truth for recovery.
//!
//! One JSON object per line, each independently parseable. `append` holds
//! the host-level write lock for the duration of a single record, flushes,
//! and fsyncs before returning, so a record that `append` acknowledged
//! survives an immediate process kill. The log is never rewritten or
//! truncated by normal operation.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, StoreError};
use crate::lock::HostLock;
use crate::model::LogRecord;

/// Durable append-only log of [`LogRecord`]s.
#[derive(Debug)]
pub struct AppendLog {
    path: PathBuf,
    lock: HostLock,
    writer: Mutex<File>,
}

/// Opaque replay position: byte offset of the next record.
pub type LogCursor = u64;

impl AppendLog {
    /// Open (creating if absent) the log at `path`, guarded by a lock file
    /// at `lock_path` with the given bounded acquisition timeout.
    pub fn open(path: impl Into<PathBuf>, lock_path: impl Into<PathBuf>, lock_timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let writer = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            lock: HostLock::new(lock_path, lock_timeout),
            writer: Mutex::new(writer),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and durably persist it before returning.
    ///
    /// The host lock is held only for the critical section; it is released
    /// on every exit path, including errors, via the guard's drop.
    pub fn append(&self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.lock.acquire()?;
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| StoreError::Database("append log writer poisoned".into()))?;
        writer.write_all(&line)?;
        writer.flush()?;
        writer.sync_data()?;
        Ok(())
    }

    /// Lazy sequence of records in append order, from the beginning.
    pub fn replay(&self) -> Result<Replay> {
        self.replay_from(0)
    }

    /// Resume replay from a cursor previously returned alongside a record.
    pub fn replay_from(&self, cursor: LogCursor) -> Result<Replay> {
        let mut file = File::open(&self.path)?;
        let len = file.metadata()?.len();
        let cursor = cursor.min(len);
        file.seek(SeekFrom::Start(cursor))?;
        Ok(Replay {
            reader: BufReader::new(file),
            offset: cursor,
            len,
        })
    }

    /// Number of valid records currently in the log.
    pub fn record_count(&self) -> Result<u64> {
        let mut count = 0;
        for entry in self.replay()? {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

/// Restartable iterator over `(next_cursor, record)` pairs.
///
/// A truncated final record (mid-write crash) is treated as absent. A
/// malformed line that is *not* the final one is skipped with a warning so
/// one bad record cannot make the rest of the log unreadable.
#[derive(Debug)]
pub struct Replay {
    reader: BufReader<File>,
    offset: u64,
    len: u64,
}

impl Iterator for Replay {
    type Item = Result<(LogCursor, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let mut line = String::new();
            let read = match self.reader.read_line(&mut line) {
                Ok(n) => n,
                Err(e) => return Some(Err(e.into())),
            };
            if read == 0 {
                return None;
            }
            let record_start = self.offset;
            self.offset += read as u64;

            if !line.ends_with('\n') {
                // Torn tail from a mid-write crash: absent, not fatal.
                return None;
            }
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(trimmed) {
                Ok(record) => return Some(Ok((self.offset, record))),
                Err(e) if self.offset >= self.len => {
                    // Final record failed to parse; treat like a torn tail.
                    warn!(offset = record_start, error = %e, "ignoring unparseable final log record");
                    return None;
                }
                Err(e) => {
                    warn!(offset = record_start, error = %e, "skipping malformed log record");
                }
            }
        }
    }
}
