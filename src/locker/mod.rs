//! Filesystem-backed per-app advisory locks.
//!
//! The queue already guarantees in-process exclusivity; these pid files
//! additionally guard against out-of-process concurrency (a second control
//! plane started by mistake, manual intervention). A lock whose recorded
//! pid is no longer alive is stale and gets reclaimed.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

pub struct AppLocker {
    lock_dir: PathBuf,
}

/// Whether a pid refers to a live process.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // Signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    true
}

impl AppLocker {
    pub fn new(data_dir: &Path) -> Result<Self> {
        let lock_dir = data_dir.join("locks");
        crate::utils::ensure_dir(&lock_dir)?;
        Ok(Self { lock_dir })
    }

    fn lock_path(&self, app_id: &str) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", app_id))
    }

    /// Take the lock for an app. Fails when a live process already holds it;
    /// stale locks are reclaimed in place.
    pub fn acquire(&self, app_id: &str) -> Result<bool> {
        let path = self.lock_path(app_id);

        if let Ok(contents) = std::fs::read_to_string(&path) {
            match contents.trim().parse::<u32>() {
                Ok(pid) if pid_alive(pid) && pid != std::process::id() => {
                    debug!(app_id = %app_id, holder = pid, "App lock held by live process");
                    return Ok(false);
                }
                Ok(pid) if pid_alive(pid) => {
                    // Our own pid: already locked in this process.
                    return Ok(false);
                }
                _ => {
                    warn!(app_id = %app_id, "Removing stale app lock");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        std::fs::write(&path, std::process::id().to_string())
            .with_context(|| format!("Failed to write lock file for app {}", app_id))?;
        Ok(true)
    }

    pub fn release(&self, app_id: &str) {
        let _ = std::fs::remove_file(self.lock_path(app_id));
    }

    pub fn is_locked(&self, app_id: &str) -> bool {
        match std::fs::read_to_string(self.lock_path(app_id)) {
            Ok(contents) => contents
                .trim()
                .parse::<u32>()
                .map(pid_alive)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Startup sweep: drop lock files whose owning process is gone.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.lock_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let alive = std::fs::read_to_string(&path)
                .ok()
                .and_then(|c| c.trim().parse::<u32>().ok())
                .map(pid_alive)
                .unwrap_or(false);
            if !alive {
                warn!(path = %path.display(), "Removing stale lock file");
                let _ = std::fs::remove_file(&path);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locker() -> (tempfile::TempDir, AppLocker) {
        let tmp = tempfile::tempdir().unwrap();
        let locker = AppLocker::new(tmp.path()).unwrap();
        (tmp, locker)
    }

    #[test]
    fn test_acquire_release_cycle() {
        let (_tmp, locker) = locker();
        assert!(locker.acquire("app-1").unwrap());
        assert!(locker.is_locked("app-1"));
        // Second acquire from this process fails: the pid is alive.
        assert!(!locker.acquire("app-1").unwrap());
        locker.release("app-1");
        assert!(!locker.is_locked("app-1"));
        assert!(locker.acquire("app-1").unwrap());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let (tmp, locker) = locker();
        // Pid 0 is never a valid process to signal from userspace... but on
        // some systems kill(0, 0) targets the process group. Use a pid well
        // beyond pid_max instead.
        std::fs::write(tmp.path().join("locks/app-1.lock"), "4194999").unwrap();
        assert!(locker.acquire("app-1").unwrap());
    }

    #[test]
    fn test_cleanup_stale_sweep() {
        let (tmp, locker) = locker();
        std::fs::write(tmp.path().join("locks/dead.lock"), "4194999").unwrap();
        std::fs::write(
            tmp.path().join("locks/live.lock"),
            std::process::id().to_string(),
        )
        .unwrap();

        let removed = locker.cleanup_stale().unwrap();
        assert_eq!(removed, 1);
        assert!(!locker.is_locked("dead"));
        assert!(locker.is_locked("live"));
    }

    #[test]
    fn test_garbage_lock_file_is_stale() {
        let (tmp, locker) = locker();
        std::fs::write(tmp.path().join("locks/app-1.lock"), "not-a-pid").unwrap();
        assert!(locker.acquire("app-1").unwrap());
    }
}
