//! Completion gates evaluated by the phase finalizer.
//!
//! Gates run in a fixed order (regression, review, deliverables) and every
//! one of them is evaluated so the decision lists all blocking conditions.

use std::collections::BTreeSet;

use crate::core::scope::normalize_path;
use crate::core::types::{Phase, RegressionSeverity, ReviewVerdict, TestDelta};

/// Blocking issues and warnings gathered across all gates.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GateFindings {
    pub blocking_issues: Vec<String>,
    pub warnings: Vec<String>,
}

impl GateFindings {
    pub fn is_blocked(&self) -> bool {
        !self.blocking_issues.is_empty()
    }
}

/// Evaluate all completion gates for `phase`.
///
/// `applied_paths` is the set of normalized paths actually written by the
/// phase's change set.
pub fn evaluate(
    phase: &Phase,
    delta: Option<&TestDelta>,
    review: &ReviewVerdict,
    applied_paths: &BTreeSet<String>,
) -> GateFindings {
    let mut findings = GateFindings::default();
    if let Some(delta) = delta {
        regression_gate(phase, delta, &mut findings);
    }
    review_gate(review, &mut findings);
    deliverables_gate(phase, applied_paths, &mut findings);
    findings
}

fn regression_gate(phase: &Phase, delta: &TestDelta, findings: &mut GateFindings) {
    if !delta.new_collection_errors_persistent.is_empty() {
        findings.blocking_issues.push(format!(
            "new collection/import errors persisted after retry: {}",
            delta.new_collection_errors_persistent.join(", ")
        ));
    }

    let validation: BTreeSet<&str> = phase
        .scope
        .validation_tests
        .iter()
        .map(String::as_str)
        .collect();
    let broken_validation: Vec<&str> = delta
        .newly_failing_persistent
        .iter()
        .chain(delta.new_collection_errors_persistent.iter())
        .map(String::as_str)
        .filter(|id| validation.contains(id))
        .collect();
    if !broken_validation.is_empty() {
        findings.blocking_issues.push(format!(
            "phase validation tests failing persistently: {}",
            broken_validation.join(", ")
        ));
    }

    match delta.regression_severity {
        RegressionSeverity::High | RegressionSeverity::Critical => {
            findings.blocking_issues.push(format!(
                "{} regression: newly failing persistent tests: {}",
                delta.regression_severity,
                list_or_none(&delta.newly_failing_persistent)
            ));
        }
        RegressionSeverity::Medium if broken_validation.is_empty() => {
            findings.warnings.push(format!(
                "medium regression: newly failing persistent tests: {}",
                list_or_none(&delta.newly_failing_persistent)
            ));
        }
        RegressionSeverity::Low => {
            findings.warnings.push(format!(
                "low regression: newly failing persistent tests: {}",
                list_or_none(&delta.newly_failing_persistent)
            ));
        }
        RegressionSeverity::Medium | RegressionSeverity::None => {}
    }

    if !delta.flaky_suspects.is_empty() {
        findings.warnings.push(format!(
            "flaky suspects (failed once, passed on retry): {}",
            delta.flaky_suspects.join(", ")
        ));
    }
}

fn review_gate(review: &ReviewVerdict, findings: &mut GateFindings) {
    if review.blocking {
        let details = if review.details.is_empty() {
            String::new()
        } else {
            format!(": {}", review.details.join("; "))
        };
        findings
            .blocking_issues
            .push(format!("review blocked ({}){details}", review.verdict));
    }
}

/// Deliverables are compared in normalized form; one that cannot be
/// normalized can never be satisfied and counts as missing.
fn deliverables_gate(phase: &Phase, applied_paths: &BTreeSet<String>, findings: &mut GateFindings) {
    let missing: Vec<&str> = phase
        .scope
        .deliverables
        .iter()
        .map(String::as_str)
        .filter(|raw| match normalize_path(raw) {
            Ok(path) => !applied_paths.contains(&path),
            Err(_) => true,
        })
        .collect();
    if !missing.is_empty() {
        findings.blocking_issues.push(format!(
            "required deliverables missing from applied changes: {}",
            missing.join(", ")
        ));
    }
}

fn list_or_none(ids: &[String]) -> String {
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.join(", ")
    }
}
