//! Exclusive file locks with holder records.
//!
//! The lock itself is an OS advisory lock (`fs2`), so it dies with its owner
//! process. The file body is a JSON holder record used only to name the
//! owner in contention errors; a record left behind by a dead owner is
//! simply overwritten by the next acquirer.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{HolderInfo, LockContended};

/// Contents of a held lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub pid: u32,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

impl From<LockHolder> for HolderInfo {
    fn from(holder: LockHolder) -> Self {
        Self {
            pid: holder.pid,
            run_id: holder.run_id,
            acquired_at: holder.acquired_at.to_rfc3339(),
        }
    }
}

/// What to lock and how long to wait for it.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Human label used in errors ("workspace lease", "execution lock").
    pub kind: &'static str,
    pub key: String,
    pub path: PathBuf,
    pub run_id: Option<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// A held lock. Released on [`FileLock::release`] or drop.
#[derive(Debug)]
pub struct FileLock {
    file: Option<File>,
    path: PathBuf,
    kind: &'static str,
    key: String,
}

impl FileLock {
    /// Poll with jitter until the lock is ours or `timeout` elapses.
    ///
    /// Never blocks past the timeout; on failure returns [`LockContended`]
    /// naming the current holder when its record is readable.
    #[instrument(skip_all, fields(kind = request.kind, key = %request.key))]
    pub fn acquire(request: &LockRequest) -> Result<Self> {
        let parent = request
            .path
            .parent()
            .with_context(|| format!("lock path missing parent {}", request.path.display()))?;
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;

        let start = Instant::now();
        loop {
            if let Some(file) = try_lock(&request.path)? {
                let lock = Self {
                    file: Some(file),
                    path: request.path.clone(),
                    kind: request.kind,
                    key: request.key.clone(),
                };
                lock.write_holder(request)?;
                debug!(waited_ms = start.elapsed().as_millis() as u64, "lock acquired");
                return Ok(lock);
            }

            let waited = start.elapsed();
            if waited >= request.timeout {
                let holder = read_holder(&request.path).map(HolderInfo::from);
                warn!(holder = ?holder, "lock contended, giving up");
                return Err(LockContended {
                    kind: request.kind,
                    key: request.key.clone(),
                    holder,
                    waited,
                }
                .into());
            }
            let poll_ms = request.poll_interval.as_millis() as u64;
            let jitter_ms = rand::thread_rng().gen_range(0..=poll_ms / 2);
            let sleep = Duration::from_millis(poll_ms + jitter_ms).min(request.timeout - waited);
            thread::sleep(sleep);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Remove the lock file, then unlock.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn write_holder(&self, request: &LockRequest) -> Result<()> {
        let Some(file) = self.file.as_ref() else {
            return Ok(());
        };
        let holder = LockHolder {
            pid: std::process::id(),
            key: request.key.clone(),
            run_id: request.run_id.clone(),
            acquired_at: Utc::now(),
        };
        let mut body = serde_json::to_vec(&holder).context("serialize lock holder")?;
        body.push(b'\n');
        let mut handle = file;
        handle.set_len(0).context("truncate lock file")?;
        handle.seek(SeekFrom::Start(0)).context("seek lock file")?;
        handle.write_all(&body).context("write lock holder")?;
        handle.sync_data().context("sync lock holder")?;
        Ok(())
    }

    fn release_inner(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        // Remove while still holding the lock so a waiter never locks a file
        // that is about to disappear; waiters re-check the inode after locking.
        let removed = match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        };
        let unlocked = FileExt::unlock(&file);
        drop(file);
        debug!(kind = self.kind, key = %self.key, "lock released");
        removed.with_context(|| format!("remove lock file {}", self.path.display()))?;
        unlocked.with_context(|| format!("unlock {}", self.path.display()))?;
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!(err = %err, path = %self.path.display(), "failed to release lock");
        }
    }
}

/// One non-blocking attempt. `Ok(None)` means someone else holds it.
fn try_lock(path: &Path) -> Result<Option<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("lock {}", path.display())),
    }
    if same_file_at_path(&file, path)? {
        Ok(Some(file))
    } else {
        // The previous holder removed the file between our open and lock.
        debug!(path = %path.display(), "lock file replaced while locking, retrying");
        let _ = FileExt::unlock(&file);
        Ok(None)
    }
}

#[cfg(unix)]
fn same_file_at_path(file: &File, path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata().context("stat locked file")?;
    match fs::metadata(path) {
        Ok(current) => Ok(held.dev() == current.dev() && held.ino() == current.ino()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

#[cfg(not(unix))]
fn same_file_at_path(_file: &File, path: &Path) -> Result<bool> {
    Ok(path.exists())
}

/// Best-effort read of the current holder record.
pub fn read_holder(path: &Path) -> Option<LockHolder> {
    let contents = fs::read_to_string(path).ok()?;
    serde_json::from_str(contents.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &Path, timeout_ms: u64) -> LockRequest {
        LockRequest {
            kind: "test lock",
            key: "k".to_string(),
            path: path.to_path_buf(),
            run_id: Some("run-1".to_string()),
            timeout: Duration::from_millis(timeout_ms),
            poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn second_acquirer_times_out_and_names_the_holder() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("locks/k.lock");
        let held = FileLock::acquire(&request(&path, 100)).expect("first");

        let start = Instant::now();
        let err = FileLock::acquire(&request(&path, 100)).expect_err("contended");
        assert!(start.elapsed() < Duration::from_secs(5));
        let contended = err.downcast_ref::<LockContended>().expect("typed");
        let holder = contended.holder.as_ref().expect("holder");
        assert_eq!(holder.pid, std::process::id());
        assert_eq!(holder.run_id.as_deref(), Some("run-1"));

        held.release().expect("release");
        assert!(!path.exists());
        FileLock::acquire(&request(&path, 100)).expect("after release");
    }

    #[test]
    fn drop_releases_the_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("k.lock");
        {
            let _lock = FileLock::acquire(&request(&path, 100)).expect("first");
        }
        assert!(!path.exists());
        let _again = FileLock::acquire(&request(&path, 100)).expect("second");
    }

    #[test]
    fn stale_holder_record_is_overwritten() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("k.lock");
        fs::write(
            &path,
            r#"{"pid":999999,"key":"k","acquired_at":"2020-01-01T00:00:00Z"}"#,
        )
        .expect("stale");
        let lock = FileLock::acquire(&request(&path, 100)).expect("acquire");
        let holder = read_holder(lock.path()).expect("holder");
        assert_eq!(holder.pid, std::process::id());
    }

    #[test]
    fn waiter_acquires_once_the_holder_releases() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("k.lock");
        let held = FileLock::acquire(&request(&path, 100)).expect("first");
        let waiter_path = path.clone();
        let waiter =
            thread::spawn(move || FileLock::acquire(&request(&waiter_path, 5_000)).map(|_| ()));
        thread::sleep(Duration::from_millis(50));
        held.release().expect("release");
        waiter.join().expect("join").expect("waiter acquired");
    }
}
