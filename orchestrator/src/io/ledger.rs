//! Append-only governance ledger.
//!
//! `{run_root}/governance.jsonl` holds one full [`GovernanceRequest`]
//! snapshot per line, written after every state transition. Rows are never
//! rewritten or deleted; the current state of a request is its last row.
//! Writers from any process serialize on an exclusive `fs2` lock held while
//! they read, check and append.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use fs2::FileExt;
use tracing::{debug, info};

use crate::core::types::{GovernanceRequest, GovernanceState};
use crate::error::GovernanceConflict;

/// Latest snapshot per request, in first-seen order.
#[derive(Debug, Default)]
pub struct LedgerSnapshot {
    order: Vec<String>,
    latest: BTreeMap<String, GovernanceRequest>,
}

impl LedgerSnapshot {
    fn push(&mut self, request: GovernanceRequest) {
        if !self.latest.contains_key(&request.request_id) {
            self.order.push(request.request_id.clone());
        }
        self.latest.insert(request.request_id.clone(), request);
    }

    pub fn get(&self, request_id: &str) -> Option<&GovernanceRequest> {
        self.latest.get(request_id)
    }

    pub fn requests(&self) -> impl Iterator<Item = &GovernanceRequest> {
        self.order.iter().filter_map(|id| self.latest.get(id))
    }

    pub fn open_for(&self, run_id: &str, phase_id: &str) -> Option<&GovernanceRequest> {
        self.requests()
            .find(|r| r.run_id == run_id && r.phase_id == phase_id && r.is_open())
    }
}

#[derive(Debug, Clone)]
pub struct GovernanceLedger {
    path: PathBuf,
}

impl GovernanceLedger {
    pub fn new(run_root: &Path) -> Self {
        Self {
            path: run_root.join("governance.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a new request in `PENDING`.
    ///
    /// Fails with [`GovernanceConflict`] if the run and phase already have
    /// an unresolved request.
    pub fn open_request(&self, request: &GovernanceRequest) -> Result<()> {
        if request.state != GovernanceState::Pending {
            return Err(anyhow!(
                "new governance request {} must start PENDING, got {:?}",
                request.request_id,
                request.state
            ));
        }
        self.append_checked(|snapshot| {
            if snapshot.get(&request.request_id).is_some() {
                return Err(anyhow!(
                    "governance request {} already exists",
                    request.request_id
                ));
            }
            if let Some(open) = snapshot.open_for(&request.run_id, &request.phase_id) {
                return Err(GovernanceConflict {
                    request_id: open.request_id.clone(),
                    run_id: open.run_id.clone(),
                    phase_id: open.phase_id.clone(),
                }
                .into());
            }
            Ok(request.clone())
        })?;
        info!(request_id = %request.request_id, run_id = %request.run_id, phase_id = %request.phase_id, "governance request opened");
        Ok(())
    }

    /// Append `next` as the new snapshot of an existing request.
    ///
    /// The move from the recorded state to `next.state` must be a legal
    /// transition.
    pub fn record_transition(&self, next: &GovernanceRequest) -> Result<()> {
        self.append_checked(|snapshot| {
            let current = snapshot
                .get(&next.request_id)
                .with_context(|| format!("unknown governance request {}", next.request_id))?;
            ensure_transition(current, next.state)?;
            Ok(next.clone())
        })?;
        debug!(request_id = %next.request_id, state = ?next.state, "governance transition recorded");
        Ok(())
    }

    /// Out-of-band decision on a request that is awaiting approval.
    pub fn resolve(&self, request_id: &str, approved: bool, by: &str) -> Result<GovernanceRequest> {
        let by = by.trim();
        if by.is_empty() {
            return Err(anyhow!("approver identity must not be empty"));
        }
        let resolved = self.append_checked(|snapshot| {
            let current = snapshot
                .get(request_id)
                .with_context(|| format!("unknown governance request {request_id}"))?;
            let state = if approved {
                GovernanceState::Approved
            } else {
                GovernanceState::Denied
            };
            ensure_transition(current, state)?;
            let mut next = current.clone();
            next.state = state;
            next.approved = Some(approved);
            next.approved_by = Some(by.to_string());
            next.resolved_at = Some(Utc::now());
            Ok(next)
        })?;
        info!(request_id, approved, by, "governance request resolved");
        Ok(resolved)
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        parse_rows(&self.path, &contents)
    }

    pub fn find(&self, request_id: &str) -> Result<Option<GovernanceRequest>> {
        Ok(self.snapshot()?.get(request_id).cloned())
    }

    /// Requests not yet resolved, oldest first.
    pub fn list_pending(&self) -> Result<Vec<GovernanceRequest>> {
        Ok(self
            .snapshot()?
            .requests()
            .filter(|r| r.is_open())
            .cloned()
            .collect())
    }

    fn append_checked<F>(&self, decide: F) -> Result<GovernanceRequest>
    where
        F: FnOnce(&LedgerSnapshot) -> Result<GovernanceRequest>,
    {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("lock {}", self.path.display()))?;
        let result = append_locked(&self.path, &mut file, decide);
        let unlocked = FileExt::unlock(&file);
        let row = result?;
        unlocked.with_context(|| format!("unlock {}", self.path.display()))?;
        Ok(row)
    }
}

fn append_locked<F>(path: &Path, file: &mut File, decide: F) -> Result<GovernanceRequest>
where
    F: FnOnce(&LedgerSnapshot) -> Result<GovernanceRequest>,
{
    file.seek(SeekFrom::Start(0))
        .with_context(|| format!("seek {}", path.display()))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)
        .with_context(|| format!("read {}", path.display()))?;
    let snapshot = parse_rows(path, &contents)?;
    let row = decide(&snapshot)?;

    let mut line = serde_json::to_string(&row).context("serialize governance row")?;
    line.push('\n');
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync {}", path.display()))?;
    Ok(row)
}

fn parse_rows(path: &Path, contents: &str) -> Result<LedgerSnapshot> {
    let mut snapshot = LedgerSnapshot::default();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let row: GovernanceRequest = serde_json::from_str(line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        snapshot.push(row);
    }
    Ok(snapshot)
}

fn ensure_transition(current: &GovernanceRequest, next: GovernanceState) -> Result<()> {
    if current.state.can_transition_to(next) {
        Ok(())
    } else {
        Err(anyhow!(
            "governance request {} cannot move from {:?} to {:?}",
            current.request_id,
            current.state,
            next
        ))
    }
}
