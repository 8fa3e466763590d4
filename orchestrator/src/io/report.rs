//! Structured test report loading and error fingerprints.
//!
//! The report is the only channel from the test runner into the core; free
//! form stdout is logged for humans and never parsed.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::core::types::{TestBaseline, TestOutcome, TestReport};

const TEST_REPORT_SCHEMA: &str = include_str!("../../schemas/test_report.schema.json");

static HEX_ADDRESS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"0x[0-9a-fA-F]+").unwrap());
static DIGITS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());

fn report_validator() -> Result<Validator> {
    let schema: Value =
        serde_json::from_str(TEST_REPORT_SCHEMA).context("parse test report schema")?;
    validator_for(&schema).map_err(|err| anyhow!("invalid test report schema: {err}"))
}

/// Load a report file, validating it against the report schema.
pub fn load_report(path: &Path) -> Result<TestReport> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read test report {}", path.display()))?;
    parse_report(&contents).with_context(|| format!("load test report {}", path.display()))
}

pub fn parse_report(contents: &str) -> Result<TestReport> {
    let value: Value = serde_json::from_str(contents).context("parse test report json")?;
    let validator = report_validator()?;
    if !validator.is_valid(&value) {
        let messages = validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "test report schema validation failed: {}",
            messages.join("; ")
        ));
    }
    serde_json::from_value(value).context("deserialize test report")
}

/// Short stable fingerprint of an error message.
///
/// Only the first line counts, with numbers and addresses masked so line
/// numbers or pointer values do not change the signature.
pub fn error_fingerprint(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or("").trim();
    let masked = HEX_ADDRESS.replace_all(first_line, "0x?");
    let masked = DIGITS.replace_all(&masked, "N");
    let digest = Sha256::digest(masked.as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Summarize a full-suite report into a baseline snapshot.
pub fn baseline_from_report(
    commit_id: &str,
    timestamp: DateTime<Utc>,
    report: &TestReport,
) -> TestBaseline {
    let outcomes = report.outcomes();
    let count = |wanted: TestOutcome| outcomes.values().filter(|o| **o == wanted).count();

    let failing_test_ids: BTreeSet<String> = report.ids_with(TestOutcome::Failed);
    let mut error_signatures = BTreeMap::new();
    for case in &report.tests {
        if case.outcome == TestOutcome::Error {
            let message = case.message.as_deref().unwrap_or("");
            error_signatures.insert(case.id.clone(), error_fingerprint(message));
        } else {
            error_signatures.remove(&case.id);
        }
    }

    TestBaseline {
        commit_id: commit_id.to_string(),
        timestamp,
        total: outcomes.len(),
        passing: count(TestOutcome::Passed),
        failing: count(TestOutcome::Failed),
        error: count(TestOutcome::Error),
        skipped: count(TestOutcome::Skipped),
        failing_test_ids: failing_test_ids
            .into_iter()
            .filter(|id| outcomes.get(id) == Some(&TestOutcome::Failed))
            .collect(),
        error_signatures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_valid_report() {
        let report = parse_report(
            r#"{"tests":[
                {"id":"a","outcome":"passed","duration_ms":3},
                {"id":"b","outcome":"error","message":"ImportError: no module x"}
            ]}"#,
        )
        .expect("parse");
        assert_eq!(report.tests.len(), 2);
        assert_eq!(report.tests[1].outcome, TestOutcome::Error);
    }

    #[test]
    fn rejects_reports_that_violate_the_schema() {
        let err = parse_report(r#"{"tests":[{"id":"a","outcome":"flaky"}]}"#)
            .expect_err("bad outcome");
        assert!(err.to_string().contains("schema validation failed"));
        assert!(parse_report(r#"{"results":[]}"#).is_err());
        assert!(parse_report("not json").is_err());
    }

    #[test]
    fn fingerprint_masks_numbers_and_ignores_later_lines() {
        let a = error_fingerprint("AssertionError at line 12 (0xdeadbeef)\ntrace one");
        let b = error_fingerprint("AssertionError at line 97 (0x1234)\ntrace two");
        let c = error_fingerprint("KeyError: 'x'");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn baseline_counts_each_id_once() {
        let report = parse_report(
            r#"{"tests":[
                {"id":"a","outcome":"passed"},
                {"id":"b","outcome":"failed"},
                {"id":"c","outcome":"error","message":"boom"},
                {"id":"d","outcome":"skipped"}
            ]}"#,
        )
        .expect("parse");
        let baseline = baseline_from_report("abc", Utc::now(), &report);
        assert_eq!(baseline.total, 4);
        assert_eq!(
            (baseline.passing, baseline.failing, baseline.error, baseline.skipped),
            (1, 1, 1, 1)
        );
        assert!(baseline.failing_test_ids.contains("b"));
        assert_eq!(baseline.error_signatures["c"], error_fingerprint("boom"));
    }
}
