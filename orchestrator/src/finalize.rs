//! Phase finalization: the only code that moves a phase out of `EXECUTING`.
//!
//! Every terminal decision is written to `decisions/{phase_id}.json` and
//! logged. A decision is never kept as mutable state; it is rebuilt from its
//! inputs on each assessment.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use tracing::{info, warn};

use crate::core::delta::{self, SeverityThresholds};
use crate::core::gates::{self, GateFindings};
use crate::core::types::{
    CiResult, GovernanceRequest, Phase, PhaseFinalizationDecision, PhaseStatus, ReviewVerdict,
    TestBaseline, TestDelta,
};
use crate::io::artifacts::{RunArtifacts, write_json_atomic};

/// Decision plus the delta it was computed from, when a baseline existed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalization {
    pub decision: PhaseFinalizationDecision,
    pub delta: Option<TestDelta>,
}

pub struct PhaseFinalizer<'a> {
    artifacts: &'a RunArtifacts,
    thresholds: SeverityThresholds,
}

impl<'a> PhaseFinalizer<'a> {
    pub fn new(artifacts: &'a RunArtifacts, thresholds: SeverityThresholds) -> Self {
        Self {
            artifacts,
            thresholds,
        }
    }

    /// `QUEUED -> EXECUTING`. A phase that already started cannot be entered
    /// again.
    pub fn begin(&self, phase: &mut Phase) -> Result<()> {
        phase.transition(PhaseStatus::Executing)?;
        info!(run_id = %self.artifacts.run_id(), phase_id = %phase.phase_id, "phase executing");
        Ok(())
    }

    /// Run every completion gate and move the phase to `COMPLETE` or
    /// `BLOCKED`.
    ///
    /// With a baseline, `ci` must carry the current report and the retry
    /// outcomes; its absence blocks rather than passing the regression gate.
    pub fn assess_completion(
        &self,
        phase: &mut Phase,
        baseline: Option<&TestBaseline>,
        ci: Option<&CiResult>,
        review: &ReviewVerdict,
        applied_paths: &BTreeSet<String>,
    ) -> Result<Finalization> {
        let delta = match (baseline, ci) {
            (Some(baseline), Some(ci)) => Some(compute_delta(baseline, ci, &self.thresholds)),
            _ => None,
        };
        let mut findings = gates::evaluate(phase, delta.as_ref(), review, applied_paths);
        if baseline.is_some() && ci.is_none() {
            findings
                .blocking_issues
                .insert(0, "baseline exists but no test results were collected".to_string());
        }
        if let Some(delta) = &delta {
            write_json_atomic(&self.artifacts.delta_path(), delta)?;
        }

        let decision = if findings.is_blocked() {
            let reason = format!(
                "blocked by {} issue(s): {}",
                findings.blocking_issues.len(),
                findings.blocking_issues.join("; ")
            );
            self.settle(phase, PhaseStatus::Blocked, reason, findings)?
        } else {
            let reason = if findings.warnings.is_empty() {
                "all completion gates passed".to_string()
            } else {
                format!(
                    "all completion gates passed with {} warning(s)",
                    findings.warnings.len()
                )
            };
            self.settle(phase, PhaseStatus::Complete, reason, findings)?
        };
        Ok(Finalization { decision, delta })
    }

    /// Block the phase on a denied (or timed out) governance request.
    pub fn block_for_governance(
        &self,
        phase: &mut Phase,
        request: &GovernanceRequest,
    ) -> Result<PhaseFinalizationDecision> {
        let decided_by = request.approved_by.as_deref().unwrap_or("nobody");
        let mut blocking_issues = vec![format!(
            "governance request {} denied by {decided_by}: out-of-scope paths {}",
            request.request_id,
            request.requested_paths.join(", ")
        )];
        blocking_issues.push(format!(
            "auto-approval rationale (risk {}): {}",
            request.risk_level,
            request.rationale.join("; ")
        ));
        let reason = format!(
            "blocked by {} issue(s): {}",
            blocking_issues.len(),
            blocking_issues.join("; ")
        );
        self.settle(
            phase,
            PhaseStatus::Blocked,
            reason,
            GateFindings {
                blocking_issues,
                warnings: Vec::new(),
            },
        )
    }

    /// Environment or collaborator failure inside the phase.
    pub fn fail(&self, phase: &mut Phase, reason: &str) -> Result<PhaseFinalizationDecision> {
        self.settle(
            phase,
            PhaseStatus::Failed,
            format!("phase failed: {reason}"),
            GateFindings {
                blocking_issues: vec![reason.to_string()],
                warnings: Vec::new(),
            },
        )
    }

    fn settle(
        &self,
        phase: &mut Phase,
        status: PhaseStatus,
        reason: String,
        findings: GateFindings,
    ) -> Result<PhaseFinalizationDecision> {
        phase.transition(status)?;
        let decision = PhaseFinalizationDecision {
            phase_id: phase.phase_id.clone(),
            can_complete: status == PhaseStatus::Complete,
            status,
            reason,
            blocking_issues: findings.blocking_issues,
            warnings: findings.warnings,
        };
        write_json_atomic(&self.artifacts.decision_path(&phase.phase_id)?, &decision)?;
        for warning in &decision.warnings {
            warn!(phase_id = %decision.phase_id, "{warning}");
        }
        if decision.can_complete {
            info!(run_id = %self.artifacts.run_id(), phase_id = %decision.phase_id, reason = %decision.reason, "phase complete");
        } else {
            warn!(
                run_id = %self.artifacts.run_id(),
                phase_id = %decision.phase_id,
                status = %decision.status,
                issues = ?decision.blocking_issues,
                "phase did not complete"
            );
        }
        Ok(decision)
    }
}

/// Delta of `ci` against `baseline`, using the retry outcomes already
/// collected; nothing is executed here.
pub fn compute_delta(
    baseline: &TestBaseline,
    ci: &CiResult,
    thresholds: &SeverityThresholds,
) -> TestDelta {
    let candidates = delta::candidates(baseline, &ci.report);
    let retry: BTreeMap<_, _> = ci
        .retry_outcomes
        .iter()
        .filter(|(id, _)| candidates.newly_failing.contains(*id))
        .map(|(id, outcome)| (id.clone(), *outcome))
        .collect();
    delta::classify(baseline, &candidates, &retry, thresholds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{PhaseScope, RegressionSeverity, RiskLevel, TestOutcome};
    use crate::error::PhaseRejected;
    use crate::io::artifacts::read_json;
    use crate::io::report::baseline_from_report;
    use crate::test_support::{phase, report, suite};
    use chrono::Utc;

    fn setup() -> (tempfile::TempDir, RunArtifacts) {
        let temp = tempfile::tempdir().expect("tempdir");
        let artifacts = RunArtifacts::new(&temp.path().join("runs"), "run-1").expect("artifacts");
        artifacts.ensure_layout().expect("layout");
        (temp, artifacts)
    }

    fn started(finalizer: &PhaseFinalizer<'_>, scope: PhaseScope) -> Phase {
        let mut p = phase("p1", scope);
        finalizer.begin(&mut p).expect("begin");
        p
    }

    #[test]
    fn flaky_and_persistent_failures_block_citing_the_persistent_one() {
        let (_temp, artifacts) = setup();
        let finalizer = PhaseFinalizer::new(&artifacts, SeverityThresholds::default());
        let mut p = started(&finalizer, PhaseScope::default());
        let baseline = baseline_from_report("c1", Utc::now(), &suite(20, &[], &[]));
        let ci = CiResult {
            report: suite(20, &["t1", "t2"], &[]),
            retry_outcomes: [
                ("t1".to_string(), TestOutcome::Passed),
                ("t2".to_string(), TestOutcome::Failed),
            ]
            .into_iter()
            .collect(),
        };

        let result = finalizer
            .assess_completion(
                &mut p,
                Some(&baseline),
                Some(&ci),
                &ReviewVerdict::approve("ok"),
                &BTreeSet::new(),
            )
            .expect("assess");
        let delta = result.delta.expect("delta");
        assert_eq!(delta.newly_failing_persistent, vec!["t2"]);
        assert_eq!(delta.flaky_suspects, vec!["t1"]);
        assert!(delta.regression_severity >= RegressionSeverity::Low);
        assert!(!result.decision.can_complete);
        assert!(result.decision.reason.contains("t2"));
        assert_eq!(p.status(), PhaseStatus::Blocked);

        let written: PhaseFinalizationDecision =
            read_json(&artifacts.decision_path("p1").expect("path"))
                .expect("read")
                .expect("present");
        assert_eq!(written, result.decision);
        assert!(artifacts.delta_path().exists());
    }

    #[test]
    fn flaky_only_completes_with_a_warning() {
        let (_temp, artifacts) = setup();
        let finalizer = PhaseFinalizer::new(&artifacts, SeverityThresholds::default());
        let mut p = started(&finalizer, PhaseScope::default());
        let baseline = baseline_from_report("c1", Utc::now(), &suite(20, &[], &[]));
        let ci = CiResult {
            report: suite(20, &["t3"], &[]),
            retry_outcomes: [("t3".to_string(), TestOutcome::Passed)].into_iter().collect(),
        };
        let result = finalizer
            .assess_completion(
                &mut p,
                Some(&baseline),
                Some(&ci),
                &ReviewVerdict::approve("ok"),
                &BTreeSet::new(),
            )
            .expect("assess");
        assert!(result.decision.can_complete);
        assert_eq!(p.status(), PhaseStatus::Complete);
        assert!(result.decision.warnings.iter().any(|w| w.contains("t3")));
    }

    #[test]
    fn validation_test_blocks_even_at_medium_severity() {
        let (_temp, artifacts) = setup();
        let finalizer = PhaseFinalizer::new(&artifacts, SeverityThresholds::default());
        let mut p = started(
            &finalizer,
            PhaseScope {
                validation_tests: vec!["t_x".to_string()],
                ..PhaseScope::default()
            },
        );
        // 1 of 50 persistent failures is a 2% ratio: medium.
        let mut base_report = suite(49, &[], &[]);
        base_report.tests.push(report(&[("t_x", TestOutcome::Passed)]).tests.remove(0));
        let baseline = baseline_from_report("c1", Utc::now(), &base_report);
        let mut current = suite(49, &[], &[]);
        current.tests.push(report(&[("t_x", TestOutcome::Failed)]).tests.remove(0));
        let ci = CiResult {
            report: current,
            retry_outcomes: [("t_x".to_string(), TestOutcome::Failed)].into_iter().collect(),
        };

        let result = finalizer
            .assess_completion(
                &mut p,
                Some(&baseline),
                Some(&ci),
                &ReviewVerdict::approve("ok"),
                &BTreeSet::new(),
            )
            .expect("assess");
        assert_eq!(
            result.delta.expect("delta").regression_severity,
            RegressionSeverity::Medium
        );
        assert!(!result.decision.can_complete);
        assert!(result.decision.blocking_issues.iter().any(|i| i.contains("t_x")));
    }

    #[test]
    fn missing_ci_with_a_baseline_blocks() {
        let (_temp, artifacts) = setup();
        let finalizer = PhaseFinalizer::new(&artifacts, SeverityThresholds::default());
        let mut p = started(&finalizer, PhaseScope::default());
        let baseline = baseline_from_report("c1", Utc::now(), &suite(3, &[], &[]));
        let result = finalizer
            .assess_completion(
                &mut p,
                Some(&baseline),
                None,
                &ReviewVerdict::approve("ok"),
                &BTreeSet::new(),
            )
            .expect("assess");
        assert!(!result.decision.can_complete);
        assert!(result.decision.blocking_issues[0].contains("no test results"));
    }

    #[test]
    fn governance_block_names_paths_and_rationale() {
        let (_temp, artifacts) = setup();
        let finalizer = PhaseFinalizer::new(&artifacts, SeverityThresholds::default());
        let mut p = started(&finalizer, PhaseScope::default());
        let request = GovernanceRequest {
            request_id: "gov-1".to_string(),
            run_id: "run-1".to_string(),
            phase_id: "p1".to_string(),
            requested_paths: vec![".env".to_string()],
            justification: String::new(),
            risk_level: RiskLevel::Critical,
            auto_approved: false,
            approved: Some(false),
            approved_by: Some("alice".to_string()),
            created_at: Utc::now(),
            state: crate::core::types::GovernanceState::Denied,
            rationale: vec![".env is a protected path; never auto-approved".to_string()],
            diff_lines: 1,
            resolved_at: Some(Utc::now()),
        };
        let decision = finalizer.block_for_governance(&mut p, &request).expect("block");
        assert_eq!(decision.status, PhaseStatus::Blocked);
        assert!(decision.reason.contains(".env"));
        assert!(decision.reason.contains("protected path"));
        assert!(decision.reason.contains("alice"));
    }

    #[test]
    fn a_finished_phase_cannot_be_entered_again() {
        let (_temp, artifacts) = setup();
        let finalizer = PhaseFinalizer::new(&artifacts, SeverityThresholds::default());
        let mut p = started(&finalizer, PhaseScope::default());
        finalizer.fail(&mut p, "builder crashed").expect("fail");
        let err = finalizer.begin(&mut p).expect_err("re-entry");
        let rejected = err.downcast_ref::<PhaseRejected>().expect("typed");
        assert_eq!(rejected.from, PhaseStatus::Failed);
    }
}
