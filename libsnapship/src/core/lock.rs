//! File-based cross-process exclusion with crash detection.
//!
//! A lock is a file created with O_EXCL under the volume's snapshot
//! directory, holding the owner's pid and host. Staleness is judged by
//! process liveness: a lock whose same-host owner is gone may be broken.
//! Lock files are the only disk-persistent coordination primitive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use slog_scope::{debug, warn};
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use strum_macros::Display as StrumDisplay;
use thiserror::Error;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, StrumDisplay)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockKind {
    Volume,
    Transfer,
    /// Restores use their own class so concurrent transfers cannot starve
    /// them.
    Restore,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LockInfo {
    pub pid: i32,
    pub host: String,
    pub started_at: DateTime<Utc>,
    pub op_kind: LockKind,
    pub session_id: Uuid,
    /// The resource the lock covers, e.g. `<destination>:<snapshot name>`
    /// for transfer sessions.
    pub key: String,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock held by pid {} on {}", .owner.pid, .owner.host)]
    Held { owner: LockInfo },
    #[error("lock file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock file corrupt at {0:?}")]
    Corrupt(PathBuf),
}

/// An acquired lock; releasing is unlinking, done on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    info: LockInfo,
}

impl LockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("failed to release lock"; "path" => ?self.path, "error" => %e);
            }
        }
    }
}

/// Acquire an exclusive lock for (kind, key) under dir. A stale lock left
/// by a dead same-host process is broken once; a live owner or a foreign
/// host fails immediately with the owner attached.
pub fn acquire(dir: &Path, kind: LockKind, key: &str, session_id: Uuid) -> Result<LockGuard, LockError> {
    let path = lock_path(dir, kind, key);
    let info = LockInfo {
        pid: std::process::id() as i32,
        host: local_hostname(),
        started_at: Utc::now(),
        op_kind: kind,
        session_id,
        key: key.to_string(),
    };

    for attempt in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                let data = serde_json::to_vec(&info).expect("lock info always serializes");
                file.write_all(&data)?;
                file.sync_all()?;
                debug!("lock acquired"; "path" => ?path, "kind" => %kind, "key" => key);
                return Ok(LockGuard { path, info });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists && attempt == 0 => {
                let owner = read_lock(&path)?;
                if owner.host == info.host && !process_alive(owner.pid) {
                    warn!(
                        "breaking stale lock";
                        "path" => ?path, "owner_pid" => owner.pid, "owner_started" => %owner.started_at
                    );
                    match std::fs::remove_file(&path) {
                        Ok(()) => continue,
                        Err(e) if e.kind() == ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                return Err(LockError::Held { owner });
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let owner = read_lock(&path)?;
                return Err(LockError::Held { owner });
            }
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("loop either returns or continues exactly once")
}

/// Metadata for every lock currently present under dir. Published for the
/// external maintenance surface ("list locks" / "break named lock").
pub fn list_locks(dir: &Path) -> Vec<(PathBuf, LockInfo)> {
    let mut locks = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return locks,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "lock").unwrap_or(false) {
            if let Ok(info) = read_lock(&path) {
                locks.push((path, info));
            }
        }
    }
    locks
}

/// Forcibly remove a lock file. The caller is the operator; no liveness
/// check is applied.
pub fn break_lock(path: &Path) -> Result<(), LockError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// True when any live lock under dir covers this snapshot name. Retention
/// never deletes a locked snapshot.
pub fn snapshot_locked(dir: &Path, snapshot_name: &str) -> bool {
    list_locks(dir).iter().any(|(_, info)| {
        info.key.ends_with(&format!(":{}", snapshot_name))
            && (info.host != local_hostname() || process_alive(info.pid))
    })
}

fn lock_path(dir: &Path, kind: LockKind, key: &str) -> PathBuf {
    let sanitized: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    dir.join(format!(".{}-{}.lock", kind, sanitized))
}

fn read_lock(path: &Path) -> Result<LockInfo, LockError> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|_| LockError::Corrupt(path.to_path_buf()))
}

fn process_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // EPERM means the process exists but belongs to someone else.
        Err(nix::Error::Sys(Errno::EPERM)) => true,
        Err(_) => false,
    }
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    nix::unistd::gethostname(&mut buf)
        .ok()
        .and_then(|h| h.to_str().ok().map(|s| s.to_string()))
        .unwrap_or_else(|| String::from("localhost"))
}
