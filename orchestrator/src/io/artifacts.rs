//! Run-scoped artifact layout.
//!
//! Every file a run produces lives under `{run_root}/{run_id}/`. Paths are
//! pure functions of the run root, the run id and the artifact key, so
//! dashboards can read them without asking the orchestrator:
//!
//! ```text
//! {run_root}/{run_id}/run.json
//! {run_root}/{run_id}/ABORT
//! {run_root}/{run_id}/baselines/{commit_id}.json
//! {run_root}/{run_id}/baselines/{commit_id}.retries.json
//! {run_root}/{run_id}/ci/delta.json
//! {run_root}/{run_id}/ci/tests.log
//! {run_root}/{run_id}/ci/tests-retry.log
//! {run_root}/{run_id}/governance/{request_id}.json
//! {run_root}/{run_id}/decisions/{phase_id}.json
//! ```

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// Check that `id` is safe to use as a single path component.
pub fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("{kind} must not be empty"));
    }
    if id.starts_with('.') {
        return Err(anyhow!("{kind} must not start with '.': '{id}'"));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(anyhow!("{kind} contains invalid character {bad:?}: '{id}'"));
    }
    Ok(())
}

/// Artifact paths for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArtifacts {
    run_id: String,
    dir: PathBuf,
}

impl RunArtifacts {
    pub fn new(run_root: &Path, run_id: &str) -> Result<Self> {
        validate_id("run id", run_id)?;
        Ok(Self {
            run_id: run_id.to_string(),
            dir: run_root.join(run_id),
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn run_record_path(&self) -> PathBuf {
        self.dir.join("run.json")
    }

    pub fn abort_marker_path(&self) -> PathBuf {
        self.dir.join("ABORT")
    }

    pub fn baselines_dir(&self) -> PathBuf {
        self.dir.join("baselines")
    }

    pub fn baseline_path(&self, commit_id: &str) -> Result<PathBuf> {
        validate_id("commit id", commit_id)?;
        Ok(self.baselines_dir().join(format!("{commit_id}.json")))
    }

    pub fn retry_ledger_path(&self, commit_id: &str) -> Result<PathBuf> {
        validate_id("commit id", commit_id)?;
        Ok(self.baselines_dir().join(format!("{commit_id}.retries.json")))
    }

    pub fn ci_dir(&self) -> PathBuf {
        self.dir.join("ci")
    }

    pub fn delta_path(&self) -> PathBuf {
        self.ci_dir().join("delta.json")
    }

    pub fn tests_log_path(&self) -> PathBuf {
        self.ci_dir().join("tests.log")
    }

    pub fn retry_log_path(&self) -> PathBuf {
        self.ci_dir().join("tests-retry.log")
    }

    /// Scratch location handed to the test runner for its report.
    pub fn report_path(&self, label: &str) -> PathBuf {
        self.ci_dir().join(format!("report-{label}.json"))
    }

    pub fn governance_path(&self, request_id: &str) -> Result<PathBuf> {
        validate_id("request id", request_id)?;
        Ok(self.dir.join("governance").join(format!("{request_id}.json")))
    }

    pub fn decision_path(&self, phase_id: &str) -> Result<PathBuf> {
        validate_id("phase id", phase_id)?;
        Ok(self.dir.join("decisions").join(format!("{phase_id}.json")))
    }

    /// Create the directory skeleton for this run.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.baselines_dir(),
            self.ci_dir(),
            self.dir.join("governance"),
            self.dir.join("decisions"),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create directory {}", dir.display()))?;
        }
        Ok(())
    }
}

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("artifact path missing parent {}", path.display()))?;
    let name = path
        .file_name()
        .with_context(|| format!("artifact path missing file name {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    Ok(parent.join(format!(
        ".{}.{}.tmp",
        name.to_string_lossy(),
        Uuid::new_v4().simple()
    )))
}

fn write_synced(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("create temp file {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("write temp file {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("sync temp file {}", path.display()))?;
    Ok(())
}

/// Durably replace `path` with `contents` (temp file + fsync + rename).
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = temp_sibling(path)?;
    write_synced(&tmp_path, contents)?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Publish `contents` at `path` only if nothing is there yet.
///
/// Returns `false` when another writer got there first; the existing file is
/// left untouched.
pub fn write_new(path: &Path, contents: &[u8]) -> Result<bool> {
    let tmp_path = temp_sibling(path)?;
    write_synced(&tmp_path, contents)?;
    let linked = fs::hard_link(&tmp_path, path);
    let _ = fs::remove_file(&tmp_path);
    match linked {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err).with_context(|| format!("publish {}", path.display())),
    }
}

/// Pretty JSON with a trailing newline; byte-stable for equal values.
pub fn to_json_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    Ok(buf.into_bytes())
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &to_json_bytes(value)?)
}

/// Read a JSON artifact; `None` if the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}
