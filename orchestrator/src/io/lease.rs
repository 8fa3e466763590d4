//! Workspace lease: exclusive ownership of one physical working-copy path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::io::lockfile::{FileLock, LockRequest};

/// Held lease over an absolute working-copy path.
#[derive(Debug)]
pub struct WorkspaceLease {
    workspace: PathBuf,
    lock: FileLock,
}

/// `{run_root}/.leases/<sha256(abs path)[..16]>.lock`
pub fn lease_path(run_root: &Path, absolute_workspace: &Path) -> PathBuf {
    let digest = Sha256::digest(absolute_workspace.to_string_lossy().as_bytes());
    let name = format!("{}.lock", &hex::encode(digest)[..16]);
    run_root.join(".leases").join(name)
}

impl WorkspaceLease {
    /// The key is the canonical path, so two spellings of one directory
    /// contend for the same lease.
    pub fn acquire(
        run_root: &Path,
        workspace: &Path,
        run_id: &str,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<Self> {
        let absolute = workspace
            .canonicalize()
            .with_context(|| format!("resolve workspace {}", workspace.display()))?;
        let lock = FileLock::acquire(&LockRequest {
            kind: "workspace lease",
            key: absolute.display().to_string(),
            path: lease_path(run_root, &absolute),
            run_id: Some(run_id.to_string()),
            timeout,
            poll_interval,
        })?;
        info!(workspace = %absolute.display(), run_id, "workspace lease acquired");
        Ok(Self {
            workspace: absolute,
            lock,
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn release(self) -> Result<()> {
        info!(workspace = %self.workspace.display(), "releasing workspace lease");
        self.lock.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockContended;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn two_spellings_of_one_directory_share_a_lease() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_root = temp.path().join("runs");
        let ws = temp.path().join("ws");
        std::fs::create_dir_all(ws.join("sub")).expect("mkdir");

        let held = WorkspaceLease::acquire(
            &run_root,
            &ws,
            "run-a",
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .expect("first");
        let err = WorkspaceLease::acquire(
            &run_root,
            &ws.join("sub/.."),
            "run-b",
            Duration::from_millis(100),
            Duration::from_millis(10),
        )
        .expect_err("same directory");
        let contended = err.downcast_ref::<LockContended>().expect("typed");
        assert_eq!(contended.kind, "workspace lease");
        held.release().expect("release");
    }

    #[test]
    fn concurrent_acquirers_exactly_one_wins() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_root = temp.path().join("runs");
        let ws = temp.path().join("ws");
        std::fs::create_dir_all(&ws).expect("mkdir");
        let barrier = Barrier::new(2);

        let results: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = ["run-a", "run-b"]
                .into_iter()
                .map(|run_id| {
                    let (run_root, ws, barrier) = (&run_root, &ws, &barrier);
                    scope.spawn(move || {
                        barrier.wait();
                        let lease = WorkspaceLease::acquire(
                            run_root,
                            ws,
                            run_id,
                            Duration::from_millis(200),
                            Duration::from_millis(10),
                        );
                        // Hold past the loser's timeout window.
                        thread::sleep(Duration::from_millis(400));
                        lease.is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("join"))
                .collect()
        });
        assert_eq!(results.iter().filter(|ok| **ok).count(), 1);
    }

    #[test]
    fn different_directories_do_not_contend() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_root = temp.path().join("runs");
        let (a, b) = (temp.path().join("a"), temp.path().join("b"));
        std::fs::create_dir_all(&a).expect("mkdir a");
        std::fs::create_dir_all(&b).expect("mkdir b");
        let t = Duration::from_millis(50);
        let _la = WorkspaceLease::acquire(&run_root, &a, "r1", t, t).expect("a");
        let _lb = WorkspaceLease::acquire(&run_root, &b, "r2", t, t).expect("b");
    }
}
