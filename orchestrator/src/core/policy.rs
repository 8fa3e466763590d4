//! Conservative auto-approval policy for out-of-scope writes.
//!
//! Pure: the caller supplies the changes and their diff sizes; the policy
//! returns a risk level and a verdict with a rationale line per reason.

use anyhow::Result;

use crate::core::scope::PathMatcher;
use crate::core::types::{ChangeKind, RiskLevel};

/// One blocked write, as seen by the policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestedChange {
    pub path: String,
    pub kind: ChangeKind,
    pub diff_lines: usize,
}

/// Outcome of the auto-approval evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalVerdict {
    pub risk_level: RiskLevel,
    pub auto_approve: bool,
    pub rationale: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GovernancePolicy {
    protected: PathMatcher,
    test_files: PathMatcher,
    doc_files: PathMatcher,
    max_auto_approve_lines: usize,
    max_auto_approve_risk: RiskLevel,
}

impl GovernancePolicy {
    pub fn new<S: AsRef<str>>(
        protected: &[S],
        test_files: &[S],
        doc_files: &[S],
        max_auto_approve_lines: usize,
        max_auto_approve_risk: RiskLevel,
    ) -> Result<Self> {
        Ok(Self {
            protected: PathMatcher::new(protected)?,
            test_files: PathMatcher::new(test_files)?,
            doc_files: PathMatcher::new(doc_files)?,
            max_auto_approve_lines,
            max_auto_approve_risk,
        })
    }

    pub fn is_protected(&self, path: &str) -> bool {
        self.protected.matches(path)
    }

    fn is_additive_test(&self, change: &RequestedChange) -> bool {
        change.kind == ChangeKind::Create && self.test_files.matches(&change.path)
    }

    fn is_doc(&self, change: &RequestedChange) -> bool {
        change.kind != ChangeKind::Delete && self.doc_files.matches(&change.path)
    }

    pub fn assess_risk(&self, changes: &[RequestedChange]) -> RiskLevel {
        changes
            .iter()
            .map(|change| {
                if self.is_protected(&change.path) {
                    RiskLevel::Critical
                } else if change.kind == ChangeKind::Delete {
                    RiskLevel::High
                } else if self.is_additive_test(change) || self.is_doc(change) {
                    RiskLevel::Low
                } else {
                    RiskLevel::Medium
                }
            })
            .max()
            .unwrap_or(RiskLevel::Low)
    }

    /// Every denial reason is collected; approval requires none.
    pub fn evaluate(&self, changes: &[RequestedChange]) -> ApprovalVerdict {
        let risk_level = self.assess_risk(changes);
        let mut rationale = Vec::new();

        for change in changes {
            if self.is_protected(&change.path) {
                rationale.push(format!(
                    "{} is a protected path; never auto-approved",
                    change.path
                ));
            }
        }
        if risk_level > self.max_auto_approve_risk {
            rationale.push(format!(
                "risk level {risk_level} exceeds auto-approval ceiling {}",
                self.max_auto_approve_risk
            ));
        }
        let total_lines: usize = changes.iter().map(|c| c.diff_lines).sum();
        if total_lines > self.max_auto_approve_lines {
            rationale.push(format!(
                "diff of {total_lines} lines exceeds auto-approval limit of {}",
                self.max_auto_approve_lines
            ));
        }
        for change in changes {
            if !self.is_protected(&change.path)
                && !self.is_additive_test(change)
                && !self.is_doc(change)
            {
                rationale.push(format!(
                    "{} ({:?}) is neither an additive test file nor documentation",
                    change.path, change.kind
                ));
            }
        }
        if changes.is_empty() {
            rationale.push("no changes to evaluate".to_string());
        }

        let auto_approve = rationale.is_empty();
        if auto_approve {
            rationale.push(format!(
                "{} additive test/doc change(s), {total_lines} lines, risk {risk_level}",
                changes.len()
            ));
        }
        ApprovalVerdict {
            risk_level,
            auto_approve,
            rationale,
        }
    }
}

/// Changed-line count between two file versions.
///
/// Lines outside the common prefix and suffix count once per side, so a
/// replaced line counts twice and a pure addition counts once per line.
pub fn diff_line_count(old: &str, new: &str) -> usize {
    let old: Vec<&str> = old.lines().collect();
    let new: Vec<&str> = new.lines().collect();
    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    (old.len() - prefix - suffix) + (new.len() - prefix - suffix)
}
