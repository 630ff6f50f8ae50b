//! Cross-process advisory file lock.
//!
//! A `pulse.db.lock` file next to the database serializes opens across
//! processes. The lock is advisory (fs2 / flock semantics): cooperating
//! PulseDB processes respect it, nothing else is enforced. Acquisition
//! retries until the configured timeout, then fails the open with
//! [`PulseError::LockTimeout`].

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use crate::error::{PulseError, Result};

/// Delay between lock acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// An exclusively held advisory lock, released on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Acquires the lock at `path`, retrying for up to `timeout_ms`.
    pub(crate) fn acquire(path: &Path, timeout_ms: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(path = %path.display(), "acquired database file lock");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    let waited = started.elapsed();
                    if waited.as_millis() as u64 >= timeout_ms {
                        return Err(PulseError::LockTimeout {
                            waited_ms: waited.as_millis() as u64,
                        });
                    }
                    std::thread::sleep(RETRY_INTERVAL.min(Duration::from_millis(
                        timeout_ms.saturating_sub(waited.as_millis() as u64),
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!(path = %self.path.display(), error = %e, "failed to release file lock");
        }
    }
}
