//! Run supervisor: composes the isolation primitives around a run's phases.
//!
//! Acquisition order is working copy, workspace lease, execution lock;
//! release is the exact reverse on every exit path. Phases of one run
//! execute strictly in declared order. Several runs execute concurrently
//! only under an explicit [`ParallelAuthorization`].

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::baseline::BaselineTracker;
use crate::core::authorization::{ParallelAuthorization, duplicate_run_id};
use crate::core::scope::normalize_path;
use crate::core::types::{Phase, PhaseFinalizationDecision, PhaseStatus};
use crate::error::{ParallelNotAuthorized, RunAborted};
use crate::finalize::PhaseFinalizer;
use crate::governance::GovernanceHandler;
use crate::io::agents::{Auditor, Builder};
use crate::io::approval::ApprovalChannel;
use crate::io::artifacts::{RunArtifacts, validate_id, write_atomic};
use crate::io::config::OrchestratorConfig;
use crate::io::exec_lock::ExecutorLock;
use crate::io::lease::WorkspaceLease;
use crate::io::ledger::GovernanceLedger;
use crate::io::run_state::{PhaseSummary, RunRecord, RunStatus};
use crate::io::test_runner::TestRunner;
use crate::io::worktree::WorkingCopy;
use crate::phase::{PhaseContext, execute_phase};

/// Declared work for one run (TOML).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunPlan {
    pub run_id: String,
    /// Revision the working copy is checked out at.
    #[serde(default = "default_base_rev")]
    pub base_rev: String,
    #[serde(default)]
    pub phases: Vec<Phase>,
}

fn default_base_rev() -> String {
    "HEAD".to_string()
}

impl RunPlan {
    pub fn validate(&self) -> Result<()> {
        validate_id("run id", &self.run_id)?;
        let mut seen = BTreeSet::new();
        for phase in &self.phases {
            validate_id("phase id", &phase.phase_id)?;
            if !seen.insert(phase.phase_id.as_str()) {
                return Err(anyhow!(
                    "run {} declares phase {} more than once",
                    self.run_id,
                    phase.phase_id
                ));
            }
            if phase.status() != PhaseStatus::Queued {
                return Err(anyhow!(
                    "phase {} must be QUEUED in a run plan, got {}",
                    phase.phase_id,
                    phase.status()
                ));
            }
            for deliverable in &phase.scope.deliverables {
                normalize_path(deliverable).with_context(|| {
                    format!("phase {} deliverable '{deliverable}'", phase.phase_id)
                })?;
            }
        }
        Ok(())
    }
}

pub fn load_plan(path: &Path) -> Result<RunPlan> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read run plan {}", path.display()))?;
    let plan: RunPlan =
        toml::from_str(&contents).with_context(|| format!("parse run plan {}", path.display()))?;
    plan.validate()
        .with_context(|| format!("invalid run plan {}", path.display()))?;
    Ok(plan)
}

/// Outcome of one run as returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    pub run_id: String,
    pub status: RunStatus,
    pub working_copy: PathBuf,
    pub decisions: Vec<PhaseFinalizationDecision>,
    pub error: Option<String>,
    /// Ref holding the run's last commit; a later plan can use it as
    /// `base_rev` to continue from there.
    pub result_ref: Option<String>,
    pub head_commit: Option<String>,
}

impl RunResult {
    pub fn all_complete(&self) -> bool {
        self.status == RunStatus::Completed && self.decisions.iter().all(|d| d.can_complete)
    }
}

/// In-process abort flag, honored between phases.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Ask a run (possibly in another process) to stop before its next phase.
pub fn request_abort(run_root: &Path, run_id: &str) -> Result<PathBuf> {
    let artifacts = RunArtifacts::new(run_root, run_id)?;
    let marker = artifacts.abort_marker_path();
    write_atomic(&marker, format!("{}\n", Utc::now().to_rfc3339()).as_bytes())?;
    info!(run_id, marker = %marker.display(), "abort requested");
    Ok(marker)
}

/// External collaborators shared by every worker.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub builder: &'a (dyn Builder + Sync),
    pub auditor: &'a (dyn Auditor + Sync),
    pub tests: &'a (dyn TestRunner + Sync),
    pub approvals: &'a (dyn ApprovalChannel + Sync),
}

pub struct RunSupervisor<'a> {
    repo_root: PathBuf,
    config: &'a OrchestratorConfig,
    agents: Collaborators<'a>,
    abort: AbortHandle,
}

impl<'a> RunSupervisor<'a> {
    pub fn new(
        repo_root: &Path,
        config: &'a OrchestratorConfig,
        agents: Collaborators<'a>,
    ) -> Self {
        Self {
            repo_root: repo_root.to_path_buf(),
            config,
            agents,
            abort: AbortHandle::new(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn run_root(&self) -> PathBuf {
        self.config.run_root_in(&self.repo_root)
    }

    /// Execute several runs in this process, one thread per run.
    ///
    /// For embedders whose collaborators live in memory; the CLI isolates
    /// runs in separate processes instead (see [`crate::workers`]). The
    /// authorization rules of [`authorize_parallel`] apply before any thread
    /// starts. Results are in plan order.
    pub fn execute_runs_in_parallel(
        &self,
        plans: &[RunPlan],
        authorization: Option<&ParallelAuthorization>,
    ) -> Result<Vec<Result<RunResult>>> {
        authorize_parallel(plans, authorization)?;
        Ok(thread::scope(|scope| {
            let workers: Vec<_> = plans
                .iter()
                .map(|plan| scope.spawn(move || self.execute_run(plan)))
                .collect();
            workers
                .into_iter()
                .zip(plans)
                .map(|(worker, plan)| {
                    worker
                        .join()
                        .unwrap_or_else(|_| Err(anyhow!("worker for run {} panicked", plan.run_id)))
                })
                .collect()
        }))
    }

    /// Execute one run end to end.
    ///
    /// Acquisition failures return `Err` before any phase runs. Once the
    /// execution lock is held, `run.json` records the terminal status
    /// before this returns, whatever the outcome.
    #[instrument(skip_all, fields(run_id = %plan.run_id))]
    pub fn execute_run(&self, plan: &RunPlan) -> Result<RunResult> {
        plan.validate()?;
        let run_root = self.run_root();
        let artifacts = RunArtifacts::new(&run_root, &plan.run_id)?;
        let suffix = Uuid::new_v4().simple().to_string();
        let copy_name = format!("{}-{}", plan.run_id, &suffix[..8]);

        let copy = WorkingCopy::create(
            &self.repo_root,
            &self.config.worktrees_dir_in(&self.repo_root),
            &copy_name,
            &plan.base_rev,
        )?;
        let lease = WorkspaceLease::acquire(
            &run_root,
            copy.path(),
            &plan.run_id,
            self.config.lease_timeout(),
            self.config.poll_interval(),
        )?;
        let lock = ExecutorLock::acquire(
            &run_root,
            &plan.run_id,
            self.config.lock_timeout(),
            self.config.poll_interval(),
        )?;
        info!(working_copy = %copy.path().display(), "isolation acquired");

        let outcome = self.drive(plan, &artifacts, &copy);
        let released = release(lock, lease, copy);
        let result = outcome?;
        released?;
        Ok(result)
    }

    fn drive(
        &self,
        plan: &RunPlan,
        artifacts: &RunArtifacts,
        copy: &WorkingCopy,
    ) -> Result<RunResult> {
        artifacts.ensure_layout()?;
        clear_stale_abort(artifacts)?;
        let mut record = RunRecord::start(&plan.run_id);
        record.working_copy = Some(copy.path().to_path_buf());
        record.save(artifacts)?;

        let mut decisions = Vec::new();
        let mut outcome = self.drive_phases(plan, artifacts, copy, &mut record, &mut decisions);
        match pin_result(copy, &plan.run_id) {
            Ok((name, head)) => {
                record.result_ref = Some(name);
                record.head_commit = Some(head);
            }
            Err(err) if outcome.is_ok() => outcome = Err(err),
            Err(err) => warn!(err = %err, "could not pin the run's last commit"),
        }
        let (status, error) = match &outcome {
            Ok(Some(aborted)) => (RunStatus::Aborted, Some(aborted.to_string())),
            Ok(None) if decisions.iter().all(|d| d.can_complete) => (RunStatus::Completed, None),
            Ok(None) => (RunStatus::Failed, None),
            Err(err) => (RunStatus::Failed, Some(format!("{err:#}"))),
        };
        record.finish(status, error.clone());
        record.save(artifacts)?;
        match status {
            RunStatus::Completed => info!(phases = decisions.len(), "run completed"),
            RunStatus::Aborted => warn!("run aborted"),
            _ => error!(
                reason = error.as_deref().unwrap_or("phase did not complete"),
                "run failed"
            ),
        }
        outcome?;
        Ok(RunResult {
            run_id: plan.run_id.clone(),
            status,
            working_copy: copy.path().to_path_buf(),
            decisions,
            error,
            result_ref: record.result_ref.clone(),
            head_commit: record.head_commit.clone(),
        })
    }

    /// `Ok(Some(_))` when the run was aborted between phases.
    fn drive_phases(
        &self,
        plan: &RunPlan,
        artifacts: &RunArtifacts,
        copy: &WorkingCopy,
        record: &mut RunRecord,
        decisions: &mut Vec<PhaseFinalizationDecision>,
    ) -> Result<Option<RunAborted>> {
        let workspace = copy.path();
        let base_commit = copy.git().head_commit()?;
        record.base_commit = Some(base_commit.clone());
        record.save(artifacts)?;

        let tracker = BaselineTracker::new(self.agents.tests, artifacts, self.config);
        let baseline = tracker.capture(workspace, &base_commit)?;
        let policy = self.config.governance.policy()?;
        let ledger = GovernanceLedger::new(&self.run_root());
        let governance = GovernanceHandler::new(&policy, &ledger, self.agents.approvals, artifacts);
        let finalizer = PhaseFinalizer::new(artifacts, *tracker.thresholds());
        let ctx = PhaseContext {
            workspace,
            builder: self.agents.builder,
            auditor: self.agents.auditor,
            governance: &governance,
            finalizer: &finalizer,
            tracker: &tracker,
            baseline: Some(&baseline),
        };

        for declared in &plan.phases {
            if self.abort_requested(artifacts) {
                return Ok(Some(RunAborted {
                    run_id: plan.run_id.clone(),
                    next_phase: declared.phase_id.clone(),
                }));
            }
            let mut phase = declared.clone();
            let outcome = match execute_phase(&ctx, &mut phase) {
                Ok(outcome) => outcome,
                Err(err) => {
                    if phase.status().is_terminal() {
                        record.phases.push(failed_summary(&phase, &err));
                    }
                    return Err(err);
                }
            };
            let request_id = outcome
                .governance_request
                .as_ref()
                .map(|r| r.request_id.clone());
            let head = copy.git().head_commit()?;
            record.head_commit = Some(head.clone());
            record
                .phases
                .push(PhaseSummary::from_decision(&outcome.decision, request_id).with_head(head));
            record.save(artifacts)?;
            let complete = outcome.decision.can_complete;
            decisions.push(outcome.decision);
            if !complete && !self.config.run.continue_after_blocked {
                warn!(phase_id = %phase.phase_id, "phase did not complete; halting run");
                break;
            }
        }
        Ok(None)
    }

    fn abort_requested(&self, artifacts: &RunArtifacts) -> bool {
        self.abort.is_aborted() || artifacts.abort_marker_path().exists()
    }
}

/// Refuse duplicate run ids, and more than one run unless `authorization`
/// covers every one of them.
pub fn authorize_parallel(
    plans: &[RunPlan],
    authorization: Option<&ParallelAuthorization>,
) -> Result<()> {
    let run_ids: Vec<String> = plans.iter().map(|p| p.run_id.clone()).collect();
    if let Some(dup) = duplicate_run_id(&run_ids) {
        return Err(anyhow!("run id {dup} requested more than once"));
    }
    if plans.len() > 1 {
        let verdict = match authorization {
            Some(grant) => grant.check(&run_ids, Utc::now()),
            None => Err("no parallel authorization artifact supplied".to_string()),
        };
        if let Err(reason) = verdict {
            return Err(ParallelNotAuthorized {
                requested: plans.len(),
                reason,
            }
            .into());
        }
        info!(
            runs = ?run_ids,
            granted_by = authorization.map(|a| a.granted_by.as_str()).unwrap_or_default(),
            "parallel runs authorized"
        );
    }
    Ok(())
}

/// An abort marker left by a previous, finished run of the same id.
fn clear_stale_abort(artifacts: &RunArtifacts) -> Result<()> {
    let marker = artifacts.abort_marker_path();
    let finished = RunRecord::load(artifacts)?.is_some_and(|r| r.status.is_terminal());
    if finished && marker.exists() {
        fs::remove_file(&marker).with_context(|| format!("remove {}", marker.display()))?;
    }
    Ok(())
}

fn failed_summary(phase: &Phase, err: &anyhow::Error) -> PhaseSummary {
    PhaseSummary {
        phase_id: phase.phase_id.clone(),
        status: phase.status(),
        can_complete: false,
        reason: format!("phase failed: {err:#}"),
        governance_request_id: None,
        head_commit: None,
        finished_at: Utc::now(),
    }
}

/// Ref a run's last commit is kept under once its working copy is removed.
pub fn result_ref_name(run_id: &str) -> String {
    format!("refs/orchestrator/runs/{run_id}")
}

fn pin_result(copy: &WorkingCopy, run_id: &str) -> Result<(String, String)> {
    let git = copy.git();
    let head = git.head_commit()?;
    let name = result_ref_name(run_id);
    git.update_ref(&name, &head)?;
    info!(result_ref = %name, commit = %head, "run head pinned");
    Ok((name, head))
}

/// Release in reverse acquisition order, attempting every step.
fn release(lock: ExecutorLock, lease: WorkspaceLease, copy: WorkingCopy) -> Result<()> {
    let results = [lock.release(), lease.release(), copy.remove()];
    let mut first_err = None;
    for result in results {
        if let Err(err) = result {
            warn!(err = %err, "release failed");
            first_err.get_or_insert(err);
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{phase, scope};

    fn plan(phases: Vec<Phase>) -> RunPlan {
        RunPlan {
            run_id: "run-1".to_string(),
            base_rev: default_base_rev(),
            phases,
        }
    }

    #[test]
    fn plan_accepts_deliverables_that_normalize() {
        let mut p1 = phase("p1", scope(&["src"]));
        p1.scope.deliverables = vec!["./src/lib.rs".to_string(), "src/a/../b.rs".to_string()];
        plan(vec![p1]).validate().expect("valid plan");
    }

    #[test]
    fn plan_rejects_deliverables_outside_the_working_copy() {
        let mut p1 = phase("p1", scope(&["src"]));
        p1.scope.deliverables = vec!["../secrets.txt".to_string()];
        let err = plan(vec![p1]).validate().expect_err("escaping deliverable");
        assert!(format!("{err:#}").contains("../secrets.txt"));

        let mut p2 = phase("p2", scope(&["src"]));
        p2.scope.deliverables = vec!["/etc/passwd".to_string()];
        assert!(plan(vec![p2]).validate().is_err());
    }

    #[test]
    fn plan_rejects_repeated_phase_ids() {
        let p = phase("p1", scope(&["src"]));
        let err = plan(vec![p.clone(), p]).validate().expect_err("duplicate");
        assert!(err.to_string().contains("more than once"));
    }
}
