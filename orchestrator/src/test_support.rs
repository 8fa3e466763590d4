//! Test-only helpers: temporary git repositories and scripted collaborators.
//!
//! Every fake is `Sync` so it can be shared by parallel run workers.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::core::types::{
    ChangeKind, FileChange, GovernanceRequest, GovernanceState, Phase, PhaseScope, Proposal,
    ReviewVerdict, RiskLevel, TestCase, TestOutcome, TestReport,
};
use crate::error::SuiteTimeout;
use crate::io::agents::{Auditor, Builder};
use crate::io::approval::{ApprovalChannel, ApprovalResponse};
use crate::io::git::Git;
use crate::io::test_runner::{TestRunRequest, TestRunner};

/// A git repository with one commit (`README.md`) in a temp directory.
///
/// The repository lives at `<temp>/repo`; [`TestRepo::scratch_dir`] is a
/// sibling outside the repository for working copies and run roots.
pub struct TestRepo {
    temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp dir")?;
        let root = temp.path().join("repo");
        fs::create_dir_all(&root).with_context(|| format!("create {}", root.display()))?;
        git(&root, &["init", "--quiet"])?;
        git(&root, &["config", "user.email", "test@example.com"])?;
        git(&root, &["config", "user.name", "test"])?;
        fs::write(root.join("README.md"), "hi\n").context("write README.md")?;
        git(&root, &["add", "README.md"])?;
        git(&root, &["commit", "--quiet", "-m", "chore: init"])?;
        Ok(Self { temp, root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.temp.path().join("scratch")
    }

    pub fn write(&self, relative: &str, contents: &str) -> Result<()> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    /// Stage and commit everything; returns the new HEAD.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        let repo = Git::new(&self.root);
        repo.add_all()?;
        repo.commit_staged(message)?;
        repo.head_commit()
    }
}

fn git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .status()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !status.success() {
        return Err(anyhow!("git {} failed: {status}", args.join(" ")));
    }
    Ok(())
}

pub fn phase(id: &str, scope: PhaseScope) -> Phase {
    Phase::new(id, scope)
}

pub fn scope(allowed: &[&str]) -> PhaseScope {
    PhaseScope {
        allowed_paths: allowed.iter().map(|s| s.to_string()).collect(),
        ..PhaseScope::default()
    }
}

pub fn report(cases: &[(&str, TestOutcome)]) -> TestReport {
    TestReport {
        tests: cases
            .iter()
            .map(|(id, outcome)| TestCase {
                id: (*id).to_string(),
                outcome: *outcome,
                duration_ms: Some(1),
                message: match outcome {
                    TestOutcome::Error => Some(format!("ImportError in {id}")),
                    TestOutcome::Failed => Some(format!("assertion failed in {id}")),
                    _ => None,
                },
            })
            .collect(),
    }
}

/// Ids `t0..t{total-1}`, passing unless listed in `failing` or `errors`.
pub fn suite(total: usize, failing: &[&str], errors: &[&str]) -> TestReport {
    let ids: Vec<String> = (0..total).map(|i| format!("t{i}")).collect();
    let cases: Vec<(&str, TestOutcome)> = ids
        .iter()
        .map(|id| {
            let outcome = if failing.contains(&id.as_str()) {
                TestOutcome::Failed
            } else if errors.contains(&id.as_str()) {
                TestOutcome::Error
            } else {
                TestOutcome::Passed
            };
            (id.as_str(), outcome)
        })
        .collect();
    report(&cases)
}

pub fn create(path: &str, contents: &str) -> FileChange {
    FileChange {
        path: path.to_string(),
        kind: ChangeKind::Create,
        contents: Some(contents.to_string()),
    }
}

pub fn proposal(changes: Vec<FileChange>, summary: &str) -> Proposal {
    Proposal {
        deliverables_touched: changes.iter().map(|c| c.path.clone()).collect(),
        changes,
        summary: summary.to_string(),
    }
}

/// A request already granted for `paths`.
pub fn granted_request(paths: &[&str]) -> GovernanceRequest {
    GovernanceRequest {
        request_id: "gov-test".to_string(),
        run_id: "run-1".to_string(),
        phase_id: "p1".to_string(),
        requested_paths: paths.iter().map(|s| s.to_string()).collect(),
        justification: "test".to_string(),
        risk_level: RiskLevel::Low,
        auto_approved: true,
        approved: Some(true),
        approved_by: Some("policy:auto".to_string()),
        created_at: Utc::now(),
        state: GovernanceState::AutoApproved,
        rationale: Vec::new(),
        diff_lines: 1,
        resolved_at: Some(Utc::now()),
    }
}

#[derive(Default)]
struct RunnerLog {
    full_by_workdir: BTreeMap<PathBuf, usize>,
    full_calls: usize,
    retry_calls: usize,
    retried_ids: Vec<String>,
}

/// Serves scripted reports instead of running a suite.
///
/// Full runs are served per working directory in order; the last report
/// repeats once the script is exhausted. Subset runs answer from the retry
/// script and omit ids it does not mention.
pub struct ScriptedTestRunner {
    full: Vec<TestReport>,
    retry: BTreeMap<String, TestOutcome>,
    time_out: bool,
    log: Mutex<RunnerLog>,
}

impl ScriptedTestRunner {
    pub fn new(full: Vec<TestReport>) -> Self {
        Self {
            full,
            retry: BTreeMap::new(),
            time_out: false,
            log: Mutex::new(RunnerLog::default()),
        }
    }

    pub fn timing_out() -> Self {
        Self {
            time_out: true,
            ..Self::new(Vec::new())
        }
    }

    pub fn with_retry(mut self, outcomes: &[(&str, TestOutcome)]) -> Self {
        self.retry = outcomes
            .iter()
            .map(|(id, outcome)| ((*id).to_string(), *outcome))
            .collect();
        self
    }

    pub fn full_calls(&self) -> usize {
        self.log().full_calls
    }

    pub fn retry_calls(&self) -> usize {
        self.log().retry_calls
    }

    pub fn retried_ids(&self) -> Vec<String> {
        self.log().retried_ids.clone()
    }

    /// Distinct working directories the suite ran in.
    pub fn workdirs(&self) -> Vec<PathBuf> {
        self.log().full_by_workdir.keys().cloned().collect()
    }

    fn log(&self) -> std::sync::MutexGuard<'_, RunnerLog> {
        self.log.lock().expect("runner log poisoned")
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRunRequest) -> Result<TestReport> {
        if self.time_out {
            return Err(SuiteTimeout {
                workdir: request.workdir.clone(),
                timeout: request.limits.timeout,
            }
            .into());
        }
        let mut log = self.log();
        match &request.ids {
            Some(ids) => {
                log.retry_calls += 1;
                log.retried_ids.extend(ids.iter().cloned());
                let answered: Vec<(&str, TestOutcome)> = ids
                    .iter()
                    .filter_map(|id| self.retry.get(id).map(|o| (id.as_str(), *o)))
                    .collect();
                Ok(report(&answered))
            }
            None => {
                log.full_calls += 1;
                let seen = log
                    .full_by_workdir
                    .entry(request.workdir.clone())
                    .or_insert(0);
                let index = (*seen).min(self.full.len().saturating_sub(1));
                *seen += 1;
                self.full
                    .get(index)
                    .cloned()
                    .ok_or_else(|| anyhow!("no scripted report for {}", request.workdir.display()))
            }
        }
    }
}

/// Returns a scripted proposal per phase id; unknown phases propose nothing.
#[derive(Default)]
pub struct ScriptedBuilder {
    proposals: BTreeMap<String, Proposal>,
    calls: AtomicUsize,
}

impl ScriptedBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, phase_id: &str, proposal: Proposal) -> Self {
        self.proposals.insert(phase_id.to_string(), proposal);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Builder for ScriptedBuilder {
    fn propose(&self, phase: &Phase, _workdir: &Path) -> Result<Proposal> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .proposals
            .get(&phase.phase_id)
            .cloned()
            .unwrap_or_default())
    }
}

/// Returns the same verdict for every review.
pub struct ScriptedAuditor {
    verdict: ReviewVerdict,
    calls: AtomicUsize,
}

impl ScriptedAuditor {
    pub fn approving() -> Self {
        Self {
            verdict: ReviewVerdict::approve("approved"),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn blocking(verdict: &str, details: &[&str]) -> Self {
        Self {
            verdict: ReviewVerdict {
                verdict: verdict.to_string(),
                blocking: true,
                details: details.iter().map(|s| s.to_string()).collect(),
            },
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Auditor for ScriptedAuditor {
    fn review(
        &self,
        _proposal: &Proposal,
        _phase: &Phase,
        _workdir: &Path,
    ) -> Result<ReviewVerdict> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.verdict.clone())
    }
}

/// Answers every approval request the same way.
pub struct ScriptedApproval {
    response: Option<ApprovalResponse>,
    calls: AtomicUsize,
}

impl ScriptedApproval {
    /// Never answers: every request times out.
    pub fn never() -> Self {
        Self {
            response: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn responding(response: ApprovalResponse) -> Self {
        Self {
            response: Some(response),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ApprovalChannel for ScriptedApproval {
    fn request_approval(&self, _request: &GovernanceRequest) -> Result<Option<ApprovalResponse>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}
