//! Cross-process lock built on atomic directory creation
//!
//! `mkdir` either creates the marker or fails with `AlreadyExists`, on every
//! local filesystem, for every process on the machine. That is the only
//! coordination primitive the registry uses; there is no in-memory state to
//! share between unrelated processes.
//!
//! A marker older than the staleness threshold is assumed to belong to a
//! crashed holder and is removed. A holder that legitimately keeps the lock
//! longer than that would lose it, so critical sections must stay short.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

/// Age after which a lock marker is force-broken
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_millis(10_000);

/// A lock marker at a fixed path
#[derive(Debug, Clone)]
pub struct RouteLock {
    path: PathBuf,
    stale_after: Duration,
}

impl RouteLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            stale_after: DEFAULT_STALE_AFTER,
        }
    }

    /// Override the staleness threshold (builder pattern)
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock, sleeping `retry_delay` between contended attempts.
    ///
    /// Returns `false` once `max_attempts` attempts have failed, or right away
    /// on any filesystem error other than the marker already existing.
    /// Blocks the calling thread; async callers should use `spawn_blocking`.
    pub fn acquire(&self, max_attempts: u32, retry_delay: Duration) -> bool {
        for attempt in 0..max_attempts {
            match std::fs::create_dir(&self.path) {
                Ok(()) => {
                    debug!(path = %self.path.display(), attempt, "Route lock acquired");
                    return true;
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match self.marker_age() {
                        Some(age) if age > self.stale_after => {
                            warn!(
                                path = %self.path.display(),
                                age_ms = age.as_millis() as u64,
                                "Breaking stale route lock"
                            );
                            let _ = std::fs::remove_dir_all(&self.path);
                            continue;
                        }
                        Some(_) => std::thread::sleep(retry_delay),
                        // Marker vanished between mkdir and stat
                        None => continue,
                    }
                }
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "Cannot create route lock");
                    return false;
                }
            }
        }

        debug!(path = %self.path.display(), max_attempts, "Timed out waiting for route lock");
        false
    }

    /// Remove the marker. Releasing an absent marker is a no-op.
    pub fn release(&self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "Failed to remove route lock");
            }
        }
    }

    /// Acquire the lock and return a guard that releases it when dropped
    pub fn lock(&self, max_attempts: u32, retry_delay: Duration) -> Option<LockGuard<'_>> {
        self.acquire(max_attempts, retry_delay)
            .then(|| LockGuard { lock: self })
    }

    /// Age of the marker, or `None` if it no longer exists.
    ///
    /// A modification time in the future counts as age zero.
    fn marker_age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(&self.path).ok()?.modified().ok()?;
        Some(
            SystemTime::now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        )
    }
}

/// Holds a [`RouteLock`] until dropped
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct LockGuard<'a> {
    lock: &'a RouteLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RouteLock::new(dir.path().join("routes.lock"));

        assert!(lock.acquire(1, Duration::from_millis(1)));
        assert!(lock.path().is_dir());

        lock.release();
        assert!(!lock.path().exists());

        // Second release is a no-op
        lock.release();
        assert!(lock.acquire(1, Duration::from_millis(1)));
    }

    #[test]
    fn test_contended_acquire_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RouteLock::new(dir.path().join("routes.lock"));

        assert!(lock.acquire(1, Duration::from_millis(1)));

        let start = Instant::now();
        assert!(!lock.acquire(3, Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[test]
    fn test_missing_parent_fails_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RouteLock::new(dir.path().join("missing").join("routes.lock"));

        let start = Instant::now();
        assert!(!lock.acquire(10, Duration::from_secs(1)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stale_marker_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.lock");
        std::fs::create_dir(&path).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let lock = RouteLock::new(&path).with_stale_after(Duration::from_millis(50));

        let start = Instant::now();
        assert!(lock.acquire(3, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_fresh_marker_is_not_broken() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.lock");
        std::fs::create_dir(&path).unwrap();

        let lock = RouteLock::new(&path);
        assert!(!lock.acquire(2, Duration::from_millis(10)));
        assert!(path.is_dir());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RouteLock::new(dir.path().join("routes.lock"));

        {
            let _guard = lock.lock(1, Duration::from_millis(1)).unwrap();
            assert!(lock.lock(1, Duration::from_millis(1)).is_none());
        }

        assert!(!lock.path().exists());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.lock");
        let inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = RouteLock::new(&path);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    let _guard = lock.lock(500, Duration::from_millis(2)).unwrap();
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_millis(5));
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
