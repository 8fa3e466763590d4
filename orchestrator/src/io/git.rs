//! Git adapter.
//!
//! Version control is consumed through the `git` command line only, wrapped
//! in a small explicit type so every call is logged and checked.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Full SHA of HEAD; the commit identity baselines are keyed by.
    pub fn head_commit(&self) -> Result<String> {
        let sha = self.rev_parse("HEAD")?;
        debug!(commit = %sha, "resolved HEAD");
        Ok(sha)
    }

    /// Full SHA `rev` resolves to.
    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let spec = format!("{rev}^{{commit}}");
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.trim().to_string())
    }

    /// Point `name` at `commit`, creating the ref if needed.
    ///
    /// Refs outside `refs/worktree/` are shared by every working copy, so a
    /// ref set from a copy outlives the copy's removal.
    #[instrument(skip_all, fields(name = %name, commit = %commit))]
    pub fn update_ref(&self, name: &str, commit: &str) -> Result<()> {
        self.run_checked(&["update-ref", name, commit])
            .with_context(|| format!("update ref {name}"))?;
        debug!("ref updated");
        Ok(())
    }

    /// Absolute path of the repository's top-level directory.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "--no-verify", "-m", message])?;
        Ok(true)
    }

    /// Create a detached working copy at `path` checked out at `rev`.
    ///
    /// The new working copy shares this repository's object store.
    #[instrument(skip_all, fields(path = %path.display(), rev = %rev))]
    pub fn worktree_add_detached(&self, path: &Path, rev: &str) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "add", "--detach", &path_arg, rev])
            .with_context(|| format!("create working copy {}", path.display()))?;
        debug!("working copy created");
        Ok(())
    }

    /// Remove a working copy, discarding any uncommitted state in it.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub fn worktree_remove_force(&self, path: &Path) -> Result<()> {
        let path_arg = path.to_string_lossy();
        self.run_checked(&["worktree", "remove", "--force", "--force", &path_arg])
            .with_context(|| format!("remove working copy {}", path.display()))?;
        debug!("working copy removed");
        Ok(())
    }

    /// Drop bookkeeping for working copies whose directories are gone.
    pub fn worktree_prune(&self) -> Result<()> {
        self.run_checked(&["worktree", "prune"])?;
        Ok(())
    }

    /// Absolute paths of all registered working copies, main one first.
    pub fn worktree_list(&self) -> Result<Vec<PathBuf>> {
        let out = self.run_capture(&["worktree", "list", "--porcelain"])?;
        Ok(out
            .lines()
            .filter_map(|line| line.strip_prefix("worktree "))
            .map(PathBuf::from)
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(args = %args.join(" "), "git command failed");
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn commit_staged_reports_whether_anything_was_committed() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let before = git.head_commit().expect("head");

        git.add_all().expect("add");
        assert!(!git.commit_staged("phase p1: nothing").expect("empty commit"));
        assert_eq!(git.head_commit().expect("head"), before);

        repo.write("src/lib.rs", "pub fn f() {}\n").expect("write");
        git.add_all().expect("add");
        assert!(git.commit_staged("phase p1: add lib").expect("commit"));
        assert_ne!(git.head_commit().expect("head"), before);
    }

    #[test]
    fn worktree_round_trip_shares_commits() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let head = git.head_commit().expect("head");
        let target = repo.path().parent().expect("parent").join(format!(
            "{}-wt",
            repo.path().file_name().expect("name").to_string_lossy()
        ));

        git.worktree_add_detached(&target, &head).expect("add");
        let wt = Git::new(&target);
        assert_eq!(wt.head_commit().expect("wt head"), head);
        assert_eq!(git.worktree_list().expect("list").len(), 2);

        std::fs::write(target.join("scratch.txt"), "dirty\n").expect("write");
        git.worktree_remove_force(&target).expect("remove");
        assert!(!target.exists());
        assert_eq!(git.worktree_list().expect("list").len(), 1);
    }

    #[test]
    fn ref_set_from_a_working_copy_survives_its_removal() {
        let repo = TestRepo::new().expect("repo");
        let main = Git::new(repo.path());
        let copy_path = repo.scratch_dir().join("copy");
        main.worktree_add_detached(&copy_path, "HEAD").expect("add");

        let copy = Git::new(&copy_path);
        std::fs::write(copy_path.join("kept.txt"), "kept\n").expect("write");
        copy.add_all().expect("add");
        assert!(copy.commit_staged("work in copy").expect("commit"));
        let head = copy.head_commit().expect("head");
        copy.update_ref("refs/orchestrator/runs/run-1", &head).expect("update");

        main.worktree_remove_force(&copy_path).expect("remove");
        main.worktree_prune().expect("prune");
        assert_eq!(main.rev_parse("refs/orchestrator/runs/run-1").expect("resolve"), head);
    }
}
