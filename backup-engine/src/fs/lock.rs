//! Run locks.
//!
//! A lock is a file created with `O_EXCL` holding the owner's host, pid and
//! start time. A holder on this host is trusted for as long as its process is
//! alive. Holders on other hosts are stale once older than the stale bound.
//! Stale locks are broken once.

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const DEFAULT_STALE_LOCK_SECS: i64 = 6 * 60 * 60; // 6 hours

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LockEntry {
    hostname: String,
    pid: u32,
    time: DateTime<Utc>,
}

impl LockEntry {
    fn current() -> Self {
        Self {
            hostname: local_hostname(),
            pid: std::process::id(),
            time: Utc::now(),
        }
    }

    fn is_stale(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        if self.hostname == local_hostname() {
            if let Some(alive) = process_alive(self.pid) {
                return !alive;
            }
        }
        now - self.time > stale_after
    }
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    entry: LockEntry,
}

impl RunLock {
    /// Acquire the lock at `path` with the default stale bound.
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::acquire_with(path, Duration::seconds(DEFAULT_STALE_LOCK_SECS))
    }

    pub fn acquire_with(path: &Path, stale_after: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        match Self::try_create(path) {
            Ok(lock) => return Ok(lock),
            Err(EngineError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }

        let holder = read_entry(path);
        match holder {
            Some(entry) if !entry.is_stale(Utc::now(), stale_after) => {
                Err(EngineError::Locked(format!(
                    "{} is held by pid {} on {} since {}",
                    path.display(),
                    entry.pid,
                    entry.hostname,
                    entry.time.to_rfc3339()
                )))
            }
            holder => {
                warn!(
                    "Breaking stale lock {} (holder: {:?})",
                    path.display(),
                    holder.map(|h| format!("pid {} on {}", h.pid, h.hostname))
                );
                fs::remove_file(path)?;
                Self::try_create(path)
            }
        }
    }

    fn try_create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        let entry = LockEntry::current();
        let data = serde_json::to_vec(&entry).map_err(|e| EngineError::Unknown(format!("lock serialize: {e}")))?;
        file.write_all(&data)?;
        file.sync_all()?;
        debug!("Acquired lock {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            entry,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        // Someone broke and retook the lock; it is theirs now.
        if read_entry(&self.path).as_ref() != Some(&self.entry) {
            warn!("Lock {} is no longer ours, leaving it in place", self.path.display());
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// An unreadable lock file counts as stale.
fn read_entry(path: &Path) -> Option<LockEntry> {
    let data = fs::read(path).ok()?;
    serde_json::from_slice(&data).ok()
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}

/// `None` when liveness can't be probed on this platform.
#[cfg(unix)]
fn process_alive(pid: u32) -> Option<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return Some(false);
    };
    // Signal 0 only checks for existence; EPERM means it exists under another user.
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Some(true),
        Err(_) => Some(false),
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> Option<bool> {
    None
}
