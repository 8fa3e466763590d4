//! Per-run working copies sharing the repository's object store.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::io::artifacts::validate_id;
use crate::io::git::Git;

/// A detached working copy owned by one run.
///
/// Removed with [`WorkingCopy::remove`]; dropping an unremoved copy removes
/// it as well so an error path cannot leak one.
#[derive(Debug)]
pub struct WorkingCopy {
    repo: Git,
    path: PathBuf,
    removed: bool,
}

impl WorkingCopy {
    /// Check out `rev` into `{worktrees_dir}/{name}`.
    ///
    /// Refuses to reuse an existing directory: it may belong to a live run.
    pub fn create(repo_root: &Path, worktrees_dir: &Path, name: &str, rev: &str) -> Result<Self> {
        validate_id("working copy name", name)?;
        let repo = Git::new(
            repo_root
                .canonicalize()
                .with_context(|| format!("resolve repository {}", repo_root.display()))?,
        );
        std::fs::create_dir_all(worktrees_dir)
            .with_context(|| format!("create directory {}", worktrees_dir.display()))?;
        let path = worktrees_dir
            .canonicalize()
            .with_context(|| format!("resolve {}", worktrees_dir.display()))?
            .join(name);
        if path.exists() {
            return Err(anyhow!(
                "working copy {} already exists; remove it or use a different run id",
                path.display()
            ));
        }
        repo.worktree_prune()?;
        repo.worktree_add_detached(&path, rev)?;
        info!(name, path = %path.display(), rev, "working copy created");
        Ok(Self {
            repo,
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git(&self) -> Git {
        Git::new(&self.path)
    }

    /// Forced removal; uncommitted state in the copy is discarded.
    pub fn remove(mut self) -> Result<()> {
        self.remove_inner()
    }

    fn remove_inner(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        if self.path.exists() {
            self.repo.worktree_remove_force(&self.path)?;
        }
        self.repo.worktree_prune()?;
        info!(path = %self.path.display(), "working copy removed");
        Ok(())
    }
}

impl Drop for WorkingCopy {
    fn drop(&mut self) {
        if let Err(err) = self.remove_inner() {
            warn!(err = %err, path = %self.path.display(), "failed to remove working copy");
        }
    }
}
