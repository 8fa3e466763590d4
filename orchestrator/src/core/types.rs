//! Shared deterministic types for the orchestration core.
//!
//! These types define stable contracts between components and the JSON
//! artifacts other tooling reads. Collections that end up serialized use
//! ordered containers so output is byte-stable across runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PhaseRejected;

/// Lifecycle status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    #[default]
    Queued,
    Executing,
    Complete,
    Failed,
    Blocked,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Executing => "EXECUTING",
            Self::Complete => "COMPLETE",
            Self::Failed => "FAILED",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorized blast radius of a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PhaseScope {
    /// Paths (prefixes or globs) the phase may write without approval.
    pub allowed_paths: Vec<String>,
    /// Paths that must be present in the applied change set.
    pub deliverables: Vec<String>,
    /// Tests this phase must keep green, regardless of overall severity.
    pub validation_tests: Vec<String>,
}

/// One bounded unit of work within a run.
///
/// `status` is private: only the finalizer may move it, through
/// [`Phase::transition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    pub phase_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub scope: PhaseScope,
    #[serde(default)]
    status: PhaseStatus,
}

impl Phase {
    pub fn new(phase_id: impl Into<String>, scope: PhaseScope) -> Self {
        Self {
            phase_id: phase_id.into(),
            description: String::new(),
            scope,
            status: PhaseStatus::Queued,
        }
    }

    pub fn status(&self) -> PhaseStatus {
        self.status
    }

    /// Move the phase to `next`, enforcing the lifecycle:
    /// `QUEUED -> EXECUTING -> {COMPLETE | FAILED | BLOCKED}`.
    pub(crate) fn transition(&mut self, next: PhaseStatus) -> Result<(), PhaseRejected> {
        let allowed = matches!(
            (self.status, next),
            (PhaseStatus::Queued, PhaseStatus::Executing)
                | (
                    PhaseStatus::Executing,
                    PhaseStatus::Complete | PhaseStatus::Failed | PhaseStatus::Blocked
                )
        );
        if !allowed {
            return Err(PhaseRejected {
                phase_id: self.phase_id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Outcome of a single test in a structured report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutcome {
    Passed,
    Failed,
    /// Collection, import, or setup error.
    Error,
    Skipped,
}

/// One entry of a structured test report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub outcome: TestOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Machine-parseable report emitted by the external test runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TestReport {
    pub tests: Vec<TestCase>,
}

impl TestReport {
    pub fn ids_with(&self, outcome: TestOutcome) -> BTreeSet<String> {
        self.tests
            .iter()
            .filter(|case| case.outcome == outcome)
            .map(|case| case.id.clone())
            .collect()
    }

    /// Last reported outcome for each id.
    pub fn outcomes(&self) -> BTreeMap<String, TestOutcome> {
        self.tests
            .iter()
            .map(|case| (case.id.clone(), case.outcome))
            .collect()
    }
}

/// Current-state test evidence handed to the finalizer: the full report and
/// the outcomes of the single retry of newly failing ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CiResult {
    pub report: TestReport,
    pub retry_outcomes: BTreeMap<String, TestOutcome>,
}

/// Immutable pass/fail snapshot of the suite at one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBaseline {
    pub commit_id: String,
    pub timestamp: DateTime<Utc>,
    pub total: usize,
    pub passing: usize,
    pub failing: usize,
    pub error: usize,
    pub skipped: usize,
    pub failing_test_ids: BTreeSet<String>,
    /// Errored test id -> short error fingerprint.
    pub error_signatures: BTreeMap<String, String>,
}

impl TestBaseline {
    /// Ids that were already broken (failed or errored) at baseline.
    pub fn broken_ids(&self) -> BTreeSet<String> {
        self.failing_test_ids
            .iter()
            .chain(self.error_signatures.keys())
            .cloned()
            .collect()
    }
}

/// How much worse the current test outcome is versus baseline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RegressionSeverity {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RegressionSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Classified difference between a baseline and a later report.
///
/// All lists are sorted by test id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TestDelta {
    pub newly_failing: Vec<String>,
    pub newly_failing_persistent: Vec<String>,
    pub newly_passing: Vec<String>,
    pub new_collection_errors: Vec<String>,
    pub new_collection_errors_persistent: Vec<String>,
    pub flaky_suspects: Vec<String>,
    pub regression_severity: RegressionSeverity,
}

/// Verdict returned by the external review step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewVerdict {
    pub verdict: String,
    #[serde(default)]
    pub blocking: bool,
    #[serde(default)]
    pub details: Vec<String>,
}

impl ReviewVerdict {
    pub fn approve(verdict: impl Into<String>) -> Self {
        Self {
            verdict: verdict.into(),
            blocking: false,
            details: Vec::new(),
        }
    }
}

/// Kind of a single file change in a candidate patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
}

/// One file write proposed by the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
}

/// Candidate change set produced by the builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Proposal {
    pub changes: Vec<FileChange>,
    #[serde(default)]
    pub deliverables_touched: Vec<String>,
    /// Free-text rationale; used as governance justification when a change
    /// falls outside the phase scope.
    #[serde(default)]
    pub summary: String,
}

/// Result of one finalization attempt. Logged and written as an artifact,
/// never kept as mutable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFinalizationDecision {
    pub phase_id: String,
    pub can_complete: bool,
    pub status: PhaseStatus,
    pub reason: String,
    pub blocking_issues: Vec<String>,
    pub warnings: Vec<String>,
}

/// Blast-radius classification of a governance request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(label)
    }
}

/// Governance request lifecycle. The absence of a record is the `NONE` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GovernanceState {
    Pending,
    AutoApproved,
    AwaitingApproval,
    Approved,
    Denied,
    Retried,
}

impl GovernanceState {
    /// True while the request has no resolution yet.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::AwaitingApproval)
    }

    pub fn can_transition_to(self, next: GovernanceState) -> bool {
        use GovernanceState::{Approved, AutoApproved, AwaitingApproval, Denied, Pending, Retried};
        matches!(
            (self, next),
            (Pending, AutoApproved | AwaitingApproval)
                | (AutoApproved, Retried)
                | (AwaitingApproval, Approved | Denied)
                | (Approved, Retried)
        )
    }
}

/// Auditable record of an attempt to write outside a phase's scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceRequest {
    pub request_id: String,
    pub run_id: String,
    pub phase_id: String,
    pub requested_paths: Vec<String>,
    pub justification: String,
    pub risk_level: RiskLevel,
    pub auto_approved: bool,
    pub approved: Option<bool>,
    pub approved_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: GovernanceState,
    /// Reasons behind the auto-approval verdict.
    pub rationale: Vec<String>,
    pub diff_lines: usize,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl GovernanceRequest {
    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }
}
