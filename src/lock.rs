//! Per-identifier mutex backed by lock files in a shared directory.
//!
//! ## What this lock is, and is not
//!
//! One lock file per identifier, held with an exclusive `flock(2)` for the
//! duration of a single orchestration call. It guarantees that at most one
//! worker *on this host* manipulates a given identifier's working directory
//! and record at a time, so two local tasks never duplicate a conversion.
//!
//! It is **not** a distributed lock. Two hosts converting the same
//! identifier simultaneously are both admitted; correctness across hosts
//! comes from the record store's checksum and engine-version guard, which
//! discards whichever result is stale. The lock only avoids wasted local
//! work.
//!
//! `flock` rather than a create-if-absent sentinel file: the kernel drops
//! the lock when the holding process dies, so a crashed attempt can never
//! wedge an identifier until manual intervention.

use crate::error::ConvertError;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::debug;

/// How long [`IdLock::acquire`] may wait for the lock.
#[derive(Debug, Clone, Copy)]
pub enum LockWait {
    /// Block until the lock is free. Used for the conversion attempt itself.
    Indefinite,
    /// Give up after the duration, returning [`ConvertError::LockTimeout`].
    /// Used for the cleanup phase so stuck cleanup cannot deadlock a
    /// future attempt.
    Timeout(Duration),
}

/// An acquired per-identifier lock. Released on drop, on every exit path.
#[derive(Debug)]
pub struct IdLock {
    // Closing the descriptor releases the flock.
    _file: File,
    id: String,
}

/// Poll interval while waiting for a contended lock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

impl IdLock {
    /// Acquire the exclusive lock for `id`, creating `lock_dir` and the
    /// lock file as needed.
    pub async fn acquire(lock_dir: &Path, id: &str, wait: LockWait) -> Result<Self, ConvertError> {
        std::fs::create_dir_all(lock_dir).map_err(|e| ConvertError::LockDir {
            dir: lock_dir.to_path_buf(),
            source: e,
        })?;
        let path = lock_file_path(lock_dir, id);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| ConvertError::LockDir {
                dir: lock_dir.to_path_buf(),
                source: e,
            })?;

        let started = Instant::now();
        loop {
            match try_flock_exclusive(&file) {
                Ok(true) => {
                    debug!("Acquired lock for '{}'", id);
                    return Ok(Self {
                        _file: file,
                        id: id.to_string(),
                    });
                }
                Ok(false) => {}
                Err(e) => {
                    return Err(ConvertError::LockDir {
                        dir: lock_dir.to_path_buf(),
                        source: e,
                    })
                }
            }

            if let LockWait::Timeout(budget) = wait {
                if started.elapsed() >= budget {
                    return Err(ConvertError::LockTimeout {
                        id: id.to_string(),
                        secs: budget.as_secs(),
                    });
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// The identifier this lock protects.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for IdLock {
    fn drop(&mut self) {
        debug!("Released lock for '{}'", self.id);
    }
}

/// Lock-file path for an identifier, with path separators made safe.
fn lock_file_path(lock_dir: &Path, id: &str) -> PathBuf {
    let safe: String = id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    lock_dir.join(format!("{safe}.lock"))
}

/// Try to take an exclusive flock on a file, non-blocking.
///
/// Returns `Ok(true)` if acquired, `Ok(false)` if another holder has it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            Ok(true)
        } else {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK => Ok(false),
                _ => Err(err),
            }
        }
    }
    #[cfg(not(unix))]
    {
        // No advisory locking on this platform. The record store's
        // checksum/engine-version guard still makes concurrent attempts
        // safe; they just waste work.
        let _ = file;
        Ok(true)
    }
}
