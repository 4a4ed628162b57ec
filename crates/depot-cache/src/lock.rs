//! Scoped read/write locking for cooperating processes.
//!
//! The cross-process implementation combines an advisory OS file lock with a
//! reader-count file guarded by its own short-held lock: the first reader
//! takes the exclusive lock and sets the count to 1, later readers only bump
//! the count, and a writer requires both a zero count and the exclusive
//! lock, recording itself with the -1 sentinel. Acquisition is a bounded
//! retry loop; expiry surfaces a typed timeout and the caller owns any
//! retry/backoff policy.
//!
//! Single-process pipelines select [`NoopLocker`] at cache construction:
//! same interface, no filesystem traffic, no cross-process safety.

use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs4::FileExt;
use tracing::{debug, warn};

use crate::error::CacheError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);
const WRITER_SENTINEL: i64 = -1;

/// Lock acquisition interface shared by the cross-process and no-op
/// implementations, keyed by the base folder being protected.
pub trait Locker: Send + Sync {
    fn read_lock(&self, key: &Path, timeout: Duration) -> Result<LockGuard, CacheError>;
    fn write_lock(&self, key: &Path, timeout: Duration) -> Result<LockGuard, CacheError>;
}

/// RAII guard releasing the lock on drop. Release failures are logged, never
/// raised: by then the caller's operation already completed.
pub struct LockGuard {
    inner: GuardInner,
}

enum GuardInner {
    Noop,
    Read {
        count_path: PathBuf,
        count_lock_path: PathBuf,
        exclusive: Option<File>,
    },
    Write {
        count_path: PathBuf,
        count_lock_path: PathBuf,
        exclusive: File,
    },
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match &mut self.inner {
            GuardInner::Noop => {}
            GuardInner::Read {
                count_path,
                count_lock_path,
                exclusive,
            } => {
                if let Err(err) = release_read(count_path, count_lock_path, exclusive) {
                    warn!(path = %count_path.display(), %err, "failed to release read lock");
                }
            }
            GuardInner::Write {
                count_path,
                count_lock_path,
                exclusive,
            } => {
                if let Err(err) = release_write(count_path, count_lock_path, exclusive) {
                    warn!(path = %count_path.display(), %err, "failed to release write lock");
                }
            }
        }
    }
}

fn release_read(
    count_path: &Path,
    count_lock_path: &Path,
    exclusive: &mut Option<File>,
) -> std::io::Result<()> {
    let _guard = lock_count_file(count_lock_path)?;
    let count = read_count(count_path).max(1);
    write_count(count_path, count - 1)?;
    if count - 1 == 0 {
        if let Some(file) = exclusive.take() {
            let _ = file.unlock();
        }
    }
    // A first reader leaving before the others implicitly releases the OS
    // lock with its handle; the remaining count keeps writers out until the
    // last reader leaves.
    Ok(())
}

fn release_write(
    count_path: &Path,
    count_lock_path: &Path,
    exclusive: &mut File,
) -> std::io::Result<()> {
    let _guard = lock_count_file(count_lock_path)?;
    write_count(count_path, 0)?;
    exclusive.unlock()
}

/// Cross-process locker backed by advisory file locks beside the protected
/// folder: `<key>.lock` (exclusive), `<key>.count` (reader count), and
/// `<key>.count.lock` (guards the count file).
#[derive(Debug, Default, Clone)]
pub struct FileLocker;

/// Documented no-op: hands out inert guards for single-process or trusted
/// pipeline deployments where cross-process safety is not enforced.
#[derive(Debug, Default, Clone)]
pub struct NoopLocker;

impl Locker for NoopLocker {
    fn read_lock(&self, _key: &Path, _timeout: Duration) -> Result<LockGuard, CacheError> {
        Ok(LockGuard {
            inner: GuardInner::Noop,
        })
    }

    fn write_lock(&self, _key: &Path, _timeout: Duration) -> Result<LockGuard, CacheError> {
        Ok(LockGuard {
            inner: GuardInner::Noop,
        })
    }
}

fn sibling(key: &Path, suffix: &str) -> PathBuf {
    let mut name = key
        .file_name()
        .map_or_else(|| std::ffi::OsString::from("_"), std::ffi::OsString::from);
    name.push(suffix);
    key.with_file_name(name)
}

fn open_lock_file(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
}

/// Take the short-held exclusive lock guarding the count file. Held only for
/// a handful of metadata operations, so a blocking acquire is fine here.
fn lock_count_file(count_lock_path: &Path) -> std::io::Result<File> {
    let file = open_lock_file(count_lock_path)?;
    file.lock_exclusive()?;
    Ok(file)
}

fn read_count(count_path: &Path) -> i64 {
    match fs::read_to_string(count_path) {
        Ok(text) => text.trim().parse::<i64>().unwrap_or(0),
        Err(_) => 0,
    }
}

fn write_count(count_path: &Path, value: i64) -> std::io::Result<()> {
    fs::write(count_path, value.to_string())
}

fn try_exclusive(path: &Path) -> std::io::Result<Option<File>> {
    let file = open_lock_file(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(Some(file)),
        Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
        Err(err) => Err(err),
    }
}

fn timeout_error(key: &Path, mode: &'static str, started: Instant) -> CacheError {
    CacheError::LockTimeout {
        key: key.display().to_string(),
        mode,
        waited_ms: started.elapsed().as_millis(),
    }
}

impl Locker for FileLocker {
    fn read_lock(&self, key: &Path, timeout: Duration) -> Result<LockGuard, CacheError> {
        let count_path = sibling(key, ".count");
        let count_lock_path = sibling(key, ".count.lock");
        let exclusive_path = sibling(key, ".lock");
        let started = Instant::now();

        loop {
            {
                let _guard = lock_count_file(&count_lock_path)
                    .map_err(|err| CacheError::storage(&count_lock_path, err))?;
                let count = read_count(&count_path);
                if count >= 1 {
                    write_count(&count_path, count + 1)
                        .map_err(|err| CacheError::storage(&count_path, err))?;
                    debug!(key = %key.display(), readers = count + 1, "read lock joined");
                    return Ok(LockGuard {
                        inner: GuardInner::Read {
                            count_path,
                            count_lock_path,
                            exclusive: None,
                        },
                    });
                }
                if count == 0 {
                    if let Some(file) = try_exclusive(&exclusive_path)
                        .map_err(|err| CacheError::storage(&exclusive_path, err))?
                    {
                        write_count(&count_path, 1)
                            .map_err(|err| CacheError::storage(&count_path, err))?;
                        debug!(key = %key.display(), "read lock acquired");
                        return Ok(LockGuard {
                            inner: GuardInner::Read {
                                count_path,
                                count_lock_path,
                                exclusive: Some(file),
                            },
                        });
                    }
                }
                // count < 0: a writer holds the folder; keep waiting.
            }
            if started.elapsed() >= timeout {
                return Err(timeout_error(key, "read", started));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn write_lock(&self, key: &Path, timeout: Duration) -> Result<LockGuard, CacheError> {
        let count_path = sibling(key, ".count");
        let count_lock_path = sibling(key, ".count.lock");
        let exclusive_path = sibling(key, ".lock");
        let started = Instant::now();

        loop {
            {
                let _guard = lock_count_file(&count_lock_path)
                    .map_err(|err| CacheError::storage(&count_lock_path, err))?;
                if read_count(&count_path) == 0 {
                    if let Some(file) = try_exclusive(&exclusive_path)
                        .map_err(|err| CacheError::storage(&exclusive_path, err))?
                    {
                        write_count(&count_path, WRITER_SENTINEL)
                            .map_err(|err| CacheError::storage(&count_path, err))?;
                        debug!(key = %key.display(), "write lock acquired");
                        return Ok(LockGuard {
                            inner: GuardInner::Write {
                                count_path,
                                count_lock_path,
                                exclusive: file,
                            },
                        });
                    }
                }
            }
            if started.elapsed() >= timeout {
                return Err(timeout_error(key, "write", started));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[test]
    fn write_lock_excludes_second_writer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let key = temp.path().join("ref");
        let locker = FileLocker;

        let held = locker.write_lock(&key, TIMEOUT).expect("first writer");
        let err = locker
            .write_lock(&key, Duration::from_millis(100))
            .unwrap_err();
        assert_eq!(err.code(), "DP640");
        drop(held);

        locker
            .write_lock(&key, TIMEOUT)
            .expect("writer proceeds after release");
    }

    #[test]
    fn readers_share_and_block_writer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let key = temp.path().join("ref");
        let locker = FileLocker;

        let first = locker.read_lock(&key, TIMEOUT).expect("first reader");
        let second = locker.read_lock(&key, TIMEOUT).expect("second reader");

        let err = locker
            .write_lock(&key, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { mode: "write", .. }));

        drop(first);
        let err = locker
            .write_lock(&key, Duration::from_millis(100))
            .unwrap_err();
        assert!(
            matches!(err, CacheError::LockTimeout { .. }),
            "one reader left must still block the writer"
        );

        drop(second);
        locker
            .write_lock(&key, TIMEOUT)
            .expect("writer proceeds once all readers left");
    }

    #[test]
    fn reader_waits_for_writer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let key = temp.path().join("ref");
        let locker = FileLocker;

        let held = locker.write_lock(&key, TIMEOUT).expect("writer");
        let err = locker
            .read_lock(&key, Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { mode: "read", .. }));
        drop(held);

        locker.read_lock(&key, TIMEOUT).expect("reader after writer");
    }

    #[test]
    fn noop_locker_always_succeeds() {
        let temp = tempfile::tempdir().expect("tempdir");
        let key = temp.path().join("ref");
        let locker = NoopLocker;

        let _a = locker.write_lock(&key, Duration::ZERO).expect("noop write");
        let _b = locker.write_lock(&key, Duration::ZERO).expect("noop write again");
        let _c = locker.read_lock(&key, Duration::ZERO).expect("noop read");
        assert!(!key.with_extension("lock").exists());
    }
}
