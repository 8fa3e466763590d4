//! Execute one phase: propose, scope-check, apply, review, test, finalize.
//!
//! Writes go through [`ScopedWriter`], which refuses a change set as a whole
//! when any path is outside the phase scope. Out-of-scope writes are routed
//! through governance; a granted request allows exactly its listed paths for
//! one retry of the blocked write.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::baseline::BaselineTracker;
use crate::core::policy::{RequestedChange, diff_line_count};
use crate::core::scope::{PathMatcher, normalize_path};
use crate::core::types::{
    ChangeKind, FileChange, GovernanceRequest, GovernanceState, Phase, PhaseFinalizationDecision,
    TestBaseline, TestDelta,
};
use crate::finalize::PhaseFinalizer;
use crate::governance::{GovernanceHandler, GovernanceOutcome};
use crate::io::agents::{Auditor, Builder};
use crate::io::artifacts::write_atomic;
use crate::io::git::Git;

/// A builder change with its path normalized and its diff size measured
/// against the working copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChange {
    pub change: FileChange,
    pub diff_lines: usize,
}

impl PlannedChange {
    pub fn path(&self) -> &str {
        &self.change.path
    }

    fn requested(&self) -> RequestedChange {
        RequestedChange {
            path: self.change.path.clone(),
            kind: self.change.kind,
            diff_lines: self.diff_lines,
        }
    }
}

/// Normalize and validate a proposal against the working copy before
/// anything is written.
pub fn plan_changes(root: &Path, changes: &[FileChange]) -> Result<Vec<PlannedChange>> {
    let mut seen = BTreeSet::new();
    let mut planned = Vec::with_capacity(changes.len());
    for change in changes {
        let path = normalize_path(&change.path)?;
        if !seen.insert(path.clone()) {
            return Err(anyhow!("proposal changes {path} more than once"));
        }
        let target = root.join(&path);
        let existing = match fs::read_to_string(&target) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err).with_context(|| format!("read {}", target.display())),
        };
        let contents = match (change.kind, &existing, &change.contents) {
            (ChangeKind::Create, Some(_), _) => {
                return Err(anyhow!("create of {path}: file already exists"));
            }
            (ChangeKind::Modify | ChangeKind::Delete, None, _) => {
                return Err(anyhow!("{:?} of {path}: file does not exist", change.kind));
            }
            (ChangeKind::Create | ChangeKind::Modify, _, None) => {
                return Err(anyhow!("{:?} of {path} carries no contents", change.kind));
            }
            (ChangeKind::Delete, _, _) => None,
            (_, _, Some(contents)) => Some(contents.clone()),
        };
        let diff_lines = diff_line_count(
            existing.as_deref().unwrap_or(""),
            contents.as_deref().unwrap_or(""),
        );
        planned.push(PlannedChange {
            change: FileChange {
                path,
                kind: change.kind,
                contents,
            },
            diff_lines,
        });
    }
    Ok(planned)
}

/// Applies change sets to a working copy, only inside the phase scope.
#[derive(Debug)]
pub struct ScopedWriter {
    root: PathBuf,
    scope: PathMatcher,
}

impl ScopedWriter {
    pub fn new(root: &Path, phase: &Phase) -> Result<Self> {
        Ok(Self {
            root: root.to_path_buf(),
            scope: PathMatcher::new(&phase.scope.allowed_paths)?,
        })
    }

    pub fn in_scope(&self, path: &str) -> bool {
        self.scope.matches(path)
    }

    /// Changes whose path falls outside the scope, in proposal order.
    pub fn out_of_scope<'c>(&self, changes: &'c [PlannedChange]) -> Vec<&'c PlannedChange> {
        changes.iter().filter(|c| !self.in_scope(c.path())).collect()
    }

    /// Apply `changes` if every path is in scope; otherwise write nothing.
    pub fn apply(&self, changes: &[PlannedChange]) -> Result<()> {
        self.apply_checked(changes, |_| false)
    }

    /// Apply `changes` with the request's paths allowed for this call only.
    ///
    /// The allowance is the exact path list of a granted request; it is
    /// built here and dropped on return.
    pub fn apply_with_allowance(
        &self,
        changes: &[PlannedChange],
        request: &GovernanceRequest,
    ) -> Result<()> {
        if !matches!(
            request.state,
            GovernanceState::AutoApproved | GovernanceState::Approved
        ) {
            return Err(anyhow!(
                "governance request {} is {:?}, not granted",
                request.request_id,
                request.state
            ));
        }
        let allowance: BTreeSet<&str> =
            request.requested_paths.iter().map(String::as_str).collect();
        self.apply_checked(changes, |path| allowance.contains(path))
    }

    fn apply_checked(
        &self,
        changes: &[PlannedChange],
        allowed: impl Fn(&str) -> bool,
    ) -> Result<()> {
        let rejected: Vec<&str> = changes
            .iter()
            .map(PlannedChange::path)
            .filter(|path| !self.in_scope(path) && !allowed(*path))
            .collect();
        if !rejected.is_empty() {
            return Err(anyhow!(
                "refusing to write outside the phase scope: {}",
                rejected.join(", ")
            ));
        }
        for planned in changes {
            let target = self.root.join(planned.path());
            match (&planned.change.kind, &planned.change.contents) {
                (ChangeKind::Delete, _) => fs::remove_file(&target)
                    .with_context(|| format!("delete {}", target.display()))?,
                (_, Some(contents)) => write_atomic(&target, contents.as_bytes())?,
                (kind, None) => {
                    return Err(anyhow!("{kind:?} of {} carries no contents", planned.path()));
                }
            }
            debug!(path = %planned.path(), kind = ?planned.change.kind, "applied change");
        }
        Ok(())
    }
}

/// Everything a phase needs from its run.
pub struct PhaseContext<'a> {
    pub workspace: &'a Path,
    pub builder: &'a dyn Builder,
    pub auditor: &'a dyn Auditor,
    pub governance: &'a GovernanceHandler<'a>,
    pub finalizer: &'a PhaseFinalizer<'a>,
    pub tracker: &'a BaselineTracker<'a>,
    /// Baseline at the run's base commit; `None` skips the regression gate.
    pub baseline: Option<&'a TestBaseline>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutcome {
    pub decision: PhaseFinalizationDecision,
    pub governance_request: Option<GovernanceRequest>,
    pub delta: Option<TestDelta>,
}

impl PhaseOutcome {
    fn settled(decision: PhaseFinalizationDecision, request: Option<GovernanceRequest>) -> Self {
        Self {
            decision,
            governance_request: request,
            delta: None,
        }
    }
}

/// Run `phase` to a terminal status.
///
/// Blocking outcomes come back as `Ok` with a populated decision. `Err` is
/// reserved for failures the run cannot continue past (suite timeout,
/// storage errors, a governance conflict); the phase is marked `FAILED`
/// first whenever it already started.
#[instrument(skip_all, fields(phase_id = %phase.phase_id))]
pub fn execute_phase(ctx: &PhaseContext<'_>, phase: &mut Phase) -> Result<PhaseOutcome> {
    ctx.finalizer.begin(phase)?;
    let git = Git::new(ctx.workspace);

    let proposal = match ctx.builder.propose(phase, ctx.workspace) {
        Ok(proposal) => proposal,
        Err(err) => {
            let decision = ctx.finalizer.fail(phase, &format!("builder failed: {err:#}"))?;
            return Ok(PhaseOutcome::settled(decision, None));
        }
    };
    let planned = match plan_changes(ctx.workspace, &proposal.changes) {
        Ok(planned) => planned,
        Err(err) => {
            let decision = ctx
                .finalizer
                .fail(phase, &format!("builder proposal rejected: {err:#}"))?;
            return Ok(PhaseOutcome::settled(decision, None));
        }
    };

    let writer = ScopedWriter::new(ctx.workspace, phase)?;
    let blocked: Vec<RequestedChange> = writer
        .out_of_scope(&planned)
        .into_iter()
        .map(PlannedChange::requested)
        .collect();

    let mut governance_request = None;
    if blocked.is_empty() {
        if let Err(err) = writer.apply(&planned) {
            let decision = ctx.finalizer.fail(phase, &format!("{err:#}"))?;
            return Ok(PhaseOutcome::settled(decision, None));
        }
    } else {
        let paths: Vec<&str> = blocked.iter().map(|c| c.path.as_str()).collect();
        info!(?paths, "proposal writes outside the phase scope");
        let handled = ctx
            .governance
            .handle_violation(&phase.phase_id, &blocked, &proposal.summary);
        let outcome = fail_on_err(ctx, phase, handled)?;
        match outcome {
            GovernanceOutcome::Denied(request) => {
                let decision = ctx.finalizer.block_for_governance(phase, &request)?;
                return Ok(PhaseOutcome::settled(decision, Some(request)));
            }
            GovernanceOutcome::Granted(request) => {
                let applied = writer.apply_with_allowance(&planned, &request);
                let request = fail_on_err(ctx, phase, ctx.governance.complete_retry(&request))?;
                if let Err(err) = applied {
                    let decision = ctx
                        .finalizer
                        .fail(phase, &format!("retry under governance allowance failed: {err:#}"))?;
                    return Ok(PhaseOutcome::settled(decision, Some(request)));
                }
                governance_request = Some(request);
            }
        }
    }

    fail_on_err(ctx, phase, git.add_all())?;
    let message = format!("phase {}: {}", phase.phase_id, proposal.summary.trim());
    if !fail_on_err(ctx, phase, git.commit_staged(message.trim_end_matches([' ', ':'])))? {
        debug!("proposal produced no changes to commit");
    }

    let review = match ctx.auditor.review(&proposal, phase, ctx.workspace) {
        Ok(review) => review,
        Err(err) => {
            let decision = ctx.finalizer.fail(phase, &format!("auditor failed: {err:#}"))?;
            return Ok(PhaseOutcome::settled(decision, governance_request));
        }
    };

    let ci = match ctx.baseline {
        Some(baseline) => {
            let head = fail_on_err(ctx, phase, git.head_commit())?;
            Some(fail_on_err(
                ctx,
                phase,
                ctx.tracker.collect_ci(ctx.workspace, &head, baseline),
            )?)
        }
        None => {
            warn!("no baseline for this run; regression gate skipped");
            None
        }
    };

    let applied_paths: BTreeSet<String> = planned
        .iter()
        .filter(|p| p.change.kind != ChangeKind::Delete)
        .map(|p| p.path().to_string())
        .collect();
    let finalization = ctx.finalizer.assess_completion(
        phase,
        ctx.baseline,
        ci.as_ref(),
        &review,
        &applied_paths,
    )?;
    Ok(PhaseOutcome {
        decision: finalization.decision,
        governance_request,
        delta: finalization.delta,
    })
}

/// Mark the phase `FAILED` before propagating a fatal error.
fn fail_on_err<T>(ctx: &PhaseContext<'_>, phase: &mut Phase, result: Result<T>) -> Result<T> {
    result.or_else(|err| {
        if let Err(settle_err) = ctx.finalizer.fail(phase, &format!("{err:#}")) {
            warn!(err = %settle_err, "could not record phase failure");
        }
        Err(err)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PhaseScope;

    fn planned(path: &str, kind: ChangeKind, contents: Option<&str>) -> PlannedChange {
        PlannedChange {
            change: FileChange {
                path: path.to_string(),
                kind,
                contents: contents.map(str::to_string),
            },
            diff_lines: 1,
        }
    }

    fn writer(root: &Path, allowed: &[&str]) -> ScopedWriter {
        let phase = Phase::new(
            "p1",
            PhaseScope {
                allowed_paths: allowed.iter().map(|s| s.to_string()).collect(),
                ..PhaseScope::default()
            },
        );
        ScopedWriter::new(root, &phase).expect("writer")
    }

    #[test]
    fn out_of_scope_change_rejects_the_whole_set() {
        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(temp.path(), &["src"]);
        let changes = vec![
            planned("src/a.rs", ChangeKind::Create, Some("a\n")),
            planned("Cargo.toml", ChangeKind::Create, Some("[package]\n")),
        ];
        let err = w.apply(&changes).expect_err("out of scope");
        assert!(err.to_string().contains("Cargo.toml"));
        assert!(!temp.path().join("src/a.rs").exists());
    }

    #[test]
    fn allowance_covers_only_the_requested_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let w = writer(temp.path(), &["src"]);
        let mut request = crate::test_support::granted_request(&["Cargo.toml"]);
        let changes = vec![
            planned("src/a.rs", ChangeKind::Create, Some("a\n")),
            planned("Cargo.toml", ChangeKind::Create, Some("[package]\n")),
        ];
        w.apply_with_allowance(&changes, &request).expect("granted");
        assert!(temp.path().join("Cargo.toml").exists());

        let more = vec![planned("build.rs", ChangeKind::Create, Some("fn main() {}\n"))];
        assert!(w.apply_with_allowance(&more, &request).is_err());
        assert!(w.apply(&[planned("Cargo.toml", ChangeKind::Modify, Some("x\n"))]).is_err());

        request.state = GovernanceState::Denied;
        assert!(w.apply_with_allowance(&changes[1..], &request).is_err());
    }

    #[test]
    fn plan_measures_diffs_and_rejects_bad_kinds() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "one\ntwo\nthree\n").expect("seed");
        let plan = plan_changes(
            temp.path(),
            &[FileChange {
                path: "./a.txt".to_string(),
                kind: ChangeKind::Modify,
                contents: Some("one\n2\nthree\n".to_string()),
            }],
        )
        .expect("plan");
        assert_eq!(plan[0].path(), "a.txt");
        assert_eq!(plan[0].diff_lines, 2);

        let create_existing = FileChange {
            path: "a.txt".to_string(),
            kind: ChangeKind::Create,
            contents: Some(String::new()),
        };
        assert!(plan_changes(temp.path(), &[create_existing]).is_err());
        let escape = FileChange {
            path: "../x".to_string(),
            kind: ChangeKind::Create,
            contents: Some(String::new()),
        };
        assert!(plan_changes(temp.path(), &[escape]).is_err());
    }
}
