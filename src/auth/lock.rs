//! Named advisory lock with staleness reclaim.
//!
//! Serializes critical sections (token refresh, account-registry mutation)
//! across OS processes sharing one filesystem. Presence + mtime of the lock
//! file is the entire protocol; a crashed holder leaves a stale file that any
//! waiter may forcibly remove after the staleness threshold.

use crate::error::CastorError;
use crate::utils::now_ms;
use rand::Rng;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::sleep;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct LockOptions {
    /// Age beyond which an existing lock is presumed abandoned.
    pub stale_after: Duration,
    /// First backoff sleep; doubles per attempt up to `max_delay`.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Attempt ceiling before `acquire` fails with a lock timeout.
    pub max_attempts: u32,
}

impl Default for LockOptions {
    fn default() -> Self {
        LockOptions {
            stale_after: Duration::from_secs(10),
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            max_attempts: 20,
        }
    }
}

/// Scoped holder of one advisory lock. Release is idempotent and also runs
/// best-effort on drop, so every exit path (including panics and `?`) lets the
/// next waiter in.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    released: bool,
}

impl LockGuard {
    pub fn release(mut self) {
        self.remove_file();
        self.released = true;
    }

    fn remove_file(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "released lock"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove lock file"),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            self.remove_file();
            self.released = true;
        }
    }
}

pub struct FileLock;

impl FileLock {
    pub async fn acquire(path: &Path) -> Result<LockGuard, CastorError> {
        Self::acquire_with(path, LockOptions::default()).await
    }

    pub async fn acquire_with(path: &Path, opts: LockOptions) -> Result<LockGuard, CastorError> {
        let mut delay = opts.base_delay;

        for attempt in 0..opts.max_attempts {
            if try_create(path)? {
                debug!(path = %path.display(), attempt, "acquired lock");
                return Ok(LockGuard {
                    path: path.to_path_buf(),
                    released: false,
                });
            }

            if reclaim_if_stale(path, opts.stale_after) {
                // Contend for it immediately; another waiter may win the race.
                continue;
            }

            sleep(delay).await;
            delay = (delay * 2).min(opts.max_delay);
        }

        warn!(path = %path.display(), attempts = opts.max_attempts, "lock acquisition timed out");
        Err(CastorError::LockTimeout(path.to_path_buf()))
    }
}

/// Exclusive create; `false` means somebody else holds the lock.
fn try_create(path: &Path) -> Result<bool, CastorError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            let marker = format!(
                "{}:{}:{}",
                std::process::id(),
                now_ms(),
                rand::rng().random::<u64>()
            );
            // Marker content is diagnostic only; a write failure does not
            // invalidate the lock.
            if let Err(e) = file.write_all(marker.as_bytes()) {
                warn!(path = %path.display(), error = %e, "failed to write lock marker");
            }
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Remove the lock file when its mtime is older than `stale_after`.
/// Returns true when a reclaim happened and the caller should retry at once.
fn reclaim_if_stale(path: &Path, stale_after: Duration) -> bool {
    let age = fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());

    match age {
        Some(age) if age >= stale_after => {
            warn!(path = %path.display(), age_ms = age.as_millis(), "removing stale lock");
            match fs::remove_file(path) {
                Ok(()) | Err(_) => true,
            }
        }
        // Missing metadata usually means the holder released between our
        // create attempt and the stat; retry right away.
        None => true,
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    fn fast_opts() -> LockOptions {
        LockOptions {
            stale_after: Duration::from_millis(200),
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            max_attempts: 30,
        }
    }

    #[tokio::test]
    async fn second_acquire_waits_for_release() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("res.lock");

        let guard = FileLock::acquire_with(&path, fast_opts()).await.expect("first");

        let acquired = Arc::new(AtomicBool::new(false));
        let waiter = {
            let path = path.clone();
            let acquired = acquired.clone();
            tokio::spawn(async move {
                let g = FileLock::acquire_with(&path, fast_opts()).await.expect("second");
                acquired.store(true, Ordering::SeqCst);
                g.release();
            })
        };

        sleep(Duration::from_millis(60)).await;
        assert!(
            !acquired.load(Ordering::SeqCst),
            "waiter must not acquire while the lock is held"
        );

        guard.release();
        waiter.await.expect("join");
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stale_lock_is_reclaimed_without_exhausting_attempts() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("res.lock");
        fs::write(&path, "12345:0:0").expect("plant stale lock");

        // Let the planted file age past the staleness threshold.
        sleep(Duration::from_millis(250)).await;

        let started = std::time::Instant::now();
        let guard = FileLock::acquire_with(&path, fast_opts()).await.expect("reclaim");
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "reclaim should not wait out the full attempt ceiling"
        );
        guard.release();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn acquire_times_out_against_a_live_lock() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("res.lock");

        let opts = LockOptions {
            stale_after: Duration::from_secs(60),
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(10),
            max_attempts: 4,
        };

        let _guard = FileLock::acquire_with(&path, opts).await.expect("first");
        let err = FileLock::acquire_with(&path, opts).await.expect_err("timeout");
        assert!(matches!(err, CastorError::LockTimeout(_)));
    }

    #[tokio::test]
    async fn guard_drop_releases_the_lock() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("res.lock");
        {
            let _guard = FileLock::acquire_with(&path, fast_opts()).await.expect("acquire");
            assert!(path.exists());
        }
        assert!(!path.exists());
    }
}
