//! Per-run execution lock: at most one supervisor executes a run id.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::io::artifacts::validate_id;
use crate::io::lockfile::{FileLock, LockRequest};

/// Held execution lock for one `run_id`, independent of any working copy.
#[derive(Debug)]
pub struct ExecutorLock {
    run_id: String,
    lock: FileLock,
}

/// `{run_root}/.locks/<run_id>.lock`
pub fn exec_lock_path(run_root: &Path, run_id: &str) -> PathBuf {
    run_root.join(".locks").join(format!("{run_id}.lock"))
}

impl ExecutorLock {
    pub fn acquire(
        run_root: &Path,
        run_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        validate_id("run id", run_id)?;
        let lock = FileLock::acquire(&LockRequest {
            kind: "execution lock",
            key: run_id.to_string(),
            path: exec_lock_path(run_root, run_id),
            run_id: Some(run_id.to_string()),
            timeout,
            poll_interval,
        })?;
        info!(run_id, "execution lock acquired");
        Ok(Self {
            run_id: run_id.to_string(),
            lock,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn release(self) -> Result<()> {
        info!(run_id = %self.run_id, "releasing execution lock");
        self.lock.release()
    }
}
