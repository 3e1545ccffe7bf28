//! File-based mutual exclusion over shared on-disk state.
//!
//! Acquisition exclusively creates `<path>.lock` containing `"<pid>:<ms>\n"`.
//! A collision is resolved by probing the recorded holder: a dead process or
//! a lockfile older than `stale_ms` is reclaimed immediately; otherwise the
//! acquirer polls until `max_wait_ms` is exhausted.

use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{self, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors surfaced by the storage lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// Cumulative wait exceeded `max_wait_ms`.
    #[error("timed out waiting for lock after {0}ms")]
    LockTimeout(u64),
    /// Any other I/O failure acquiring or releasing the lock.
    #[error("lock I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for the storage lock.
pub type LockResult<T> = Result<T, LockError>;

/// Tunables for [`acquire_file_lock`] / [`with_file_lock`].
#[derive(Debug, Clone, Copy)]
pub struct LockConfig {
    /// Total time budget for acquisition before giving up with `LockTimeout`.
    pub max_wait_ms: u64,
    /// Sleep between retries while contended.
    pub poll_ms: u64,
    /// Age past which a held lockfile is considered abandoned.
    pub stale_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 30_000,
            poll_ms: 50,
            stale_ms: 10_000,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn lock_path_for(target: &Path) -> PathBuf {
    let mut s = target.as_os_str().to_owned();
    s.push(".lock");
    PathBuf::from(s)
}

fn read_holder(lock_path: &Path) -> Option<(u32, u64)> {
    let mut content = String::new();
    File::open(lock_path).ok()?.read_to_string(&mut content).ok()?;
    let (pid_str, ms_str) = content.trim().split_once(':')?;
    Some((pid_str.parse().ok()?, ms_str.parse().ok()?))
}

fn lockfile_age_ms(lock_path: &Path) -> Option<u64> {
    let meta = fs::metadata(lock_path).ok()?;
    let modified = meta.modified().ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default()
            .as_millis() as u64,
    )
}

#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // No such process: the signal-0 probe conclusively reports death.
        Err(nix::errno::Errno::ESRCH) => false,
        // Any other errno (e.g. EPERM) means the process exists but we
        // can't signal it; treat it as alive.
        Err(_) => true,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

/// A guard holding an acquired file lock. Releasing is unlink-on-drop so the
/// lock is freed on every exit path, including panics unwinding through it.
pub struct FileLockGuard {
    lock_path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Unlink failures are swallowed: a stale-or-dead reclaim by another
        // acquirer will recover the same ground.
        if let Err(e) = fs::remove_file(&self.lock_path) {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %self.lock_path.display(), error = %e, "failed to release lockfile");
            }
        }
    }
}

/// Attempt to exclusively acquire the lock for `path`, polling and
/// reclaiming dead/stale holders until `config.max_wait_ms` elapses.
pub async fn acquire_file_lock(path: &Path, config: &LockConfig) -> LockResult<FileLockGuard> {
    let lock_path = lock_path_for(path);
    let pid = std::process::id();
    let start = Instant::now();

    loop {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut f) => {
                write!(f, "{}:{}\n", pid, now_ms())?;
                f.sync_all()?;
                return Ok(FileLockGuard { lock_path });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if let Some((holder_pid, _acquired_ms)) = read_holder(&lock_path) {
                    if !pid_alive(holder_pid) {
                        debug!(pid = holder_pid, "reclaiming lock from dead holder");
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                }
                if let Some(age) = lockfile_age_ms(&lock_path) {
                    if age > config.stale_ms {
                        debug!(age_ms = age, "reclaiming stale lock");
                        let _ = fs::remove_file(&lock_path);
                        continue;
                    }
                }

                let elapsed = start.elapsed().as_millis() as u64;
                if elapsed >= config.max_wait_ms {
                    return Err(LockError::LockTimeout(config.max_wait_ms));
                }
                let remaining = config.max_wait_ms - elapsed;
                let sleep_ms = config.poll_ms.min(remaining);
                tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Run `critical` while holding an exclusive lock on `path`. The lock is
/// released on every exit path, including the future panicking, because
/// release is tied to the guard's `Drop`.
pub async fn with_file_lock<F, Fut, T>(path: &Path, config: &LockConfig, critical: F) -> LockResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let _guard = acquire_file_lock(path, config).await?;
    Ok(critical().await)
}

/// Write `content` to `path` atomically: write a sibling temp file, fsync,
/// then rename over the target. On rename failure the temp file is
/// best-effort removed and the rename error is propagated (not any cleanup
/// error from the removal).
pub fn atomic_write_text_file(path: &Path, content: &str) -> io::Result<()> {
    let pid = std::process::id();
    let rand_suffix: u64 = rand::thread_rng().gen();
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".tmp-{}-{:x}", pid, rand_suffix));
    let tmp_path = PathBuf::from(tmp_name);

    {
        let mut f = File::create(&tmp_path)?;
        f.write_all(content.as_bytes())?;
        f.sync_all()?;
    }

    match fs::rename(&tmp_path, path) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            let _ = fs::remove_file(&tmp_path);
            Err(rename_err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn tmp_path(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("agentsched-lock-test-{}-{}", std::process::id(), name));
        p
    }

    #[tokio::test]
    async fn acquire_and_release_roundtrip() {
        let target = tmp_path("roundtrip");
        let lock_path = lock_path_for(&target);
        let _ = fs::remove_file(&lock_path);

        let guard = acquire_file_lock(&target, &LockConfig::default()).await.unwrap();
        assert!(lock_path.exists());
        drop(guard);
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn dead_holder_is_reclaimed_without_waiting_for_stale_ms() {
        let target = tmp_path("dead-holder");
        let lock_path = lock_path_for(&target);
        let _ = fs::remove_file(&lock_path);

        // A pid vanishingly unlikely to be alive, written directly so the
        // lockfile looks freshly held (not stale by age).
        let dead_pid = 999_999u32;
        let mut f = File::create(&lock_path).unwrap();
        write!(f, "{}:{}\n", dead_pid, now_ms()).unwrap();
        drop(f);

        let config = LockConfig {
            max_wait_ms: 5_000,
            poll_ms: 10,
            stale_ms: 60_000,
        };
        let start = Instant::now();
        let guard = acquire_file_lock(&target, &config).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(2_000));
        drop(guard);
    }

    #[test]
    fn atomic_write_then_read_roundtrips() {
        let target = tmp_path("atomic-write");
        let _ = fs::remove_file(&target);
        atomic_write_text_file(&target, "hello world").unwrap();
        let read_back = fs::read_to_string(&target).unwrap();
        assert_eq!(read_back, "hello world");
        let _ = fs::remove_file(&target);
    }
}
