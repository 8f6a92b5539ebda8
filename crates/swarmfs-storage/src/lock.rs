//! Cross-process advisory file lock with a bounded wait.
//!
//! The lock lives on a companion file (`<target>.lock`), never on the document
//! being edited, so optimistic readers of the document are not blocked. The
//! OS lock (`flock` on POSIX, `LockFileEx` on Windows, via `fs2`) is the only
//! signal: the companion file is left in place on release, and a file left
//! behind by a killed process is free because the kernel dropped its lock.
//!
//! Locks are not reentrant. Each `acquire` opens its own handle, so a second
//! acquisition of the same path from the same process blocks like any other
//! caller.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use swarmfs_core::{Config, Error, Result};
use tracing::{debug, warn};

/// Wait budget for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl LockOptions {
    #[must_use]
    pub const fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self::new(config.lock_timeout, config.lock_poll_interval)
    }
}

/// Companion lock file for a document path.
#[must_use]
pub fn lock_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{name}.lock"))
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Advisory lock on the companion file of `target`.
#[derive(Debug, Clone)]
pub struct FileLock {
    target: PathBuf,
    lock_path: PathBuf,
    options: LockOptions,
}

impl FileLock {
    /// Lock for `target` with default wait budget (10s, polling every 50ms).
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let lock_path = lock_path_for(&target);
        Self {
            target,
            lock_path,
            options: LockOptions::default(),
        }
    }

    #[must_use]
    pub const fn with_options(mut self, options: LockOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.options.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn target(&self) -> &Path {
        &self.target
    }

    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn open(&self) -> Result<File> {
        ensure_parent_dir(&self.lock_path)?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        Ok(file)
    }

    /// Block until the lock is held or the timeout elapses.
    pub fn acquire(&self) -> Result<LockGuard> {
        let start = Instant::now();
        let file = self.open()?;
        let poll = self.options.poll_interval.max(Duration::from_millis(1));
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match file.try_lock_exclusive() {
                Ok(()) => {
                    debug!(
                        lock = %self.lock_path.display(),
                        attempts,
                        waited_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "lock acquired"
                    );
                    return Ok(LockGuard::new(file, self.lock_path.clone()));
                }
                Err(e) if is_contended(&e) => {
                    let elapsed = start.elapsed();
                    if elapsed >= self.options.timeout {
                        return Err(Error::LockTimeout {
                            path: self.lock_path.clone(),
                            waited: elapsed,
                        });
                    }
                    std::thread::sleep(poll.min(self.options.timeout - elapsed));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Single non-blocking attempt. `Ok(None)` when another holder has it.
    pub fn try_acquire(&self) -> Result<Option<LockGuard>> {
        let file = self.open()?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(LockGuard::new(file, self.lock_path.clone()))),
            Err(e) if is_contended(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Held lock. Released on `release()` or on drop, whichever comes first.
#[derive(Debug)]
pub struct LockGuard {
    file: Option<File>,
    path: PathBuf,
    acquired_at: Instant,
}

impl LockGuard {
    fn new(file: File, path: PathBuf) -> Self {
        Self {
            file: Some(file),
            path,
            acquired_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn is_held(&self) -> bool {
        self.file.is_some()
    }

    #[must_use]
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Release the lock. Idempotent; unlock failures are logged, not raised
    /// (closing the handle releases the OS lock regardless).
    pub fn release(&mut self) {
        let Some(file) = self.file.take() else {
            return;
        };
        if let Err(e) = FileExt::unlock(&file) {
            warn!(lock = %self.path.display(), error = %e, "failed to unlock, closing handle");
        }
        drop(file);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Run `f` while holding the lock for `target`.
pub fn with_lock<T, F>(target: &Path, options: LockOptions, f: F) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    let mut guard = FileLock::new(target).with_options(options).acquire()?;
    let result = f();
    guard.release();
    result
}
