//! Baseline-versus-report classification and regression severity.
//!
//! Pure functions: the retry step that feeds [`classify`] lives in
//! `baseline.rs`; this module only sorts ids into buckets.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::core::types::{RegressionSeverity, TestBaseline, TestDelta, TestOutcome, TestReport};

/// Severity thresholds, expressed against the baseline suite size.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub medium_ratio: f64,
    pub high_ratio: f64,
    pub critical_ratio: f64,
    /// Absolute persistent-failure count that is always critical.
    pub critical_count: usize,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            medium_ratio: 0.01,
            high_ratio: 0.05,
            critical_ratio: 0.20,
            critical_count: 10,
        }
    }
}

/// Ids that broke since baseline, before any retry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Candidates {
    /// Failures and errors that were not broken at baseline.
    pub newly_failing: BTreeSet<String>,
    /// The subset of `newly_failing` that are collection/import errors.
    pub new_collection_errors: BTreeSet<String>,
    /// Broken at baseline, passing now.
    pub newly_passing: BTreeSet<String>,
}

impl Candidates {
    pub fn is_empty(&self) -> bool {
        self.newly_failing.is_empty()
    }

    /// The only ids a retry may touch.
    pub fn retry_ids(&self) -> Vec<String> {
        self.newly_failing.iter().cloned().collect()
    }
}

/// Set-difference the report against the baseline.
pub fn candidates(baseline: &TestBaseline, report: &TestReport) -> Candidates {
    let broken_before = baseline.broken_ids();
    let failed_now = report.ids_with(TestOutcome::Failed);
    let errored_now = report.ids_with(TestOutcome::Error);
    let passed_now = report.ids_with(TestOutcome::Passed);

    let new_collection_errors: BTreeSet<String> =
        errored_now.difference(&broken_before).cloned().collect();
    let newly_failing: BTreeSet<String> = failed_now
        .union(&errored_now)
        .filter(|id| !broken_before.contains(*id))
        .cloned()
        .collect();
    let newly_passing: BTreeSet<String> =
        broken_before.intersection(&passed_now).cloned().collect();

    Candidates {
        newly_failing,
        new_collection_errors,
        newly_passing,
    }
}

/// Build the delta from candidates and the outcomes of the single retry.
///
/// A candidate that passed on retry is a flaky suspect. Anything else,
/// including an id the retry did not report, stays persistent.
pub fn classify(
    baseline: &TestBaseline,
    candidates: &Candidates,
    retry: &BTreeMap<String, TestOutcome>,
    thresholds: &SeverityThresholds,
) -> TestDelta {
    let recovered = |id: &String| retry.get(id) == Some(&TestOutcome::Passed);

    let flaky_suspects: Vec<String> = candidates
        .newly_failing
        .iter()
        .filter(|&id| recovered(id))
        .cloned()
        .collect();
    let new_collection_errors_persistent: Vec<String> = candidates
        .new_collection_errors
        .iter()
        .filter(|&id| !recovered(id))
        .cloned()
        .collect();
    // Collection errors are reported in their own bucket.
    let newly_failing_persistent: Vec<String> = candidates
        .newly_failing
        .iter()
        .filter(|&id| !recovered(id) && !candidates.new_collection_errors.contains(id))
        .cloned()
        .collect();

    let regression_severity = severity(
        newly_failing_persistent.len(),
        !new_collection_errors_persistent.is_empty(),
        baseline.total,
        thresholds,
    );

    TestDelta {
        newly_failing: candidates.newly_failing.iter().cloned().collect(),
        newly_failing_persistent,
        newly_passing: candidates.newly_passing.iter().cloned().collect(),
        new_collection_errors: candidates.new_collection_errors.iter().cloned().collect(),
        new_collection_errors_persistent,
        flaky_suspects,
        regression_severity,
    }
}

/// Monotonic in `persistent_failures` for a fixed suite size.
pub fn severity(
    persistent_failures: usize,
    persistent_collection_errors: bool,
    suite_size: usize,
    thresholds: &SeverityThresholds,
) -> RegressionSeverity {
    let by_count = if persistent_failures == 0 {
        RegressionSeverity::None
    } else {
        let ratio = persistent_failures as f64 / suite_size.max(1) as f64;
        if ratio >= thresholds.critical_ratio || persistent_failures >= thresholds.critical_count {
            RegressionSeverity::Critical
        } else if ratio >= thresholds.high_ratio {
            RegressionSeverity::High
        } else if ratio >= thresholds.medium_ratio {
            RegressionSeverity::Medium
        } else {
            RegressionSeverity::Low
        }
    };
    if persistent_collection_errors {
        by_count.max(RegressionSeverity::High)
    } else {
        by_count
    }
}
