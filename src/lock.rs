//! File Lock (C3): an advisory cross-host lock on a media file, realized as
//! a `<media>.mediabox.lock` sidecar created with exclusive-create
//! semantics. Stale locks (older than `stale_after`) are reclaimable by any
//! Runner — the only recovery path for a crashed worker.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LockError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub hostname: String,
    pub pid: u32,
    pub timestamp: f64,
    pub locked_at: DateTime<Utc>,
    pub file: String,
}

/// An acquired lock. Dropping it releases the sidecar unconditionally —
/// every exit path (return, `?`, panic unwind) runs the `Drop` impl, which
/// is how guaranteed release on all exit paths is enforced in Rust
/// without a manual `finally`.
#[derive(Debug)]
pub struct Lock {
    sidecar_path: PathBuf,
}

impl Drop for Lock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.sidecar_path);
    }
}

fn sidecar_path_for(media_path: &Path) -> PathBuf {
    let mut name = media_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(".mediabox.lock");
    media_path
        .parent()
        .map(|p| p.join(&name))
        .unwrap_or_else(|| PathBuf::from(&name))
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_string())
}

fn read_existing(sidecar: &Path) -> Option<LockFile> {
    let data = std::fs::read(sidecar).ok()?;
    serde_json::from_slice(&data).ok()
}

fn write_lock_file(sidecar: &Path, lock: &LockFile) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create(true).truncate(true).open(sidecar)?;
    let data = serde_json::to_vec_pretty(lock).unwrap_or_default();
    file.write_all(&data)
}

/// Acquires the lock, or reports who holds it. `stale_after` is the
/// reclaim threshold (defaults to 30 minutes).
pub fn acquire(media_path: &Path, stale_after: Duration) -> Result<Lock, LockError> {
    let sidecar = sidecar_path_for(media_path);

    let our_lock = LockFile {
        hostname: hostname(),
        pid: std::process::id(),
        timestamp: Utc::now().timestamp() as f64,
        locked_at: Utc::now(),
        file: media_path.to_string_lossy().into_owned(),
    };

    match OpenOptions::new().write(true).create_new(true).open(&sidecar) {
        Ok(mut file) => {
            let data = serde_json::to_vec_pretty(&our_lock).unwrap_or_default();
            file.write_all(&data).map_err(|source| LockError::Unavailable {
                path: sidecar.clone(),
                source,
            })?;
            Ok(Lock { sidecar_path: sidecar })
        }
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let Some(existing) = read_existing(&sidecar) else {
                // Unreadable/corrupt sidecar: treat like a foreign stale lock
                // and reclaim it rather than wedging forever.
                write_lock_file(&sidecar, &our_lock).map_err(|source| LockError::Unavailable {
                    path: sidecar.clone(),
                    source,
                })?;
                return Ok(Lock { sidecar_path: sidecar });
            };

            let age_secs = (Utc::now().timestamp() as f64 - existing.timestamp).max(0.0) as u64;
            if age_secs as u128 > stale_after.as_secs() as u128 {
                write_lock_file(&sidecar, &our_lock).map_err(|source| LockError::Unavailable {
                    path: sidecar.clone(),
                    source,
                })?;
                return Ok(Lock { sidecar_path: sidecar });
            }

            Err(LockError::HeldBy {
                hostname: existing.hostname,
                pid: existing.pid,
                age_secs,
            })
        }
        Err(source) => Err(LockError::Unavailable {
            path: sidecar,
            source,
        }),
    }
}

pub fn release(lock: Lock) {
    drop(lock);
}
