//! Test baseline capture, diff and the bounded retry of new failures.
//!
//! Baselines are cached per commit under the run's `baselines/` directory;
//! a cache hit never runs the suite. The retry ledger beside each baseline
//! records every id already retried at a commit, which makes the one-retry
//! bound hold across repeated calls and process restarts.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::delta::{self, SeverityThresholds};
use crate::core::types::{CiResult, TestBaseline, TestDelta, TestOutcome, TestReport};
use crate::io::artifacts::{RunArtifacts, read_json, to_json_bytes, write_json_atomic, write_new};
use crate::io::config::OrchestratorConfig;
use crate::io::process::ProcessLimits;
use crate::io::report::baseline_from_report;
use crate::io::test_runner::{TestRunRequest, TestRunner};

pub struct BaselineTracker<'a> {
    runner: &'a dyn TestRunner,
    artifacts: &'a RunArtifacts,
    suite_limits: ProcessLimits,
    retry_limits: ProcessLimits,
    thresholds: SeverityThresholds,
}

impl<'a> BaselineTracker<'a> {
    pub fn new(
        runner: &'a dyn TestRunner,
        artifacts: &'a RunArtifacts,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            runner,
            artifacts,
            suite_limits: config.suite_limits(),
            retry_limits: config.retry_limits(),
            thresholds: config.regression,
        }
    }

    pub fn thresholds(&self) -> &SeverityThresholds {
        &self.thresholds
    }

    /// Cached baseline for `commit_id`, if one was captured in this run.
    pub fn load(&self, commit_id: &str) -> Result<Option<TestBaseline>> {
        read_json(&self.artifacts.baseline_path(commit_id)?)
    }

    /// Return the baseline for `commit_id`, running the full suite only on a
    /// cache miss.
    ///
    /// Concurrent captures of one commit are safe: the first persisted
    /// snapshot wins and every caller returns it.
    #[instrument(skip_all, fields(run_id = %self.artifacts.run_id(), commit_id = %commit_id))]
    pub fn capture(&self, workspace: &Path, commit_id: &str) -> Result<TestBaseline> {
        let path = self.artifacts.baseline_path(commit_id)?;
        if let Some(cached) = read_json::<TestBaseline>(&path)? {
            debug!("baseline cache hit");
            return Ok(cached);
        }

        info!("capturing baseline");
        let report = self.run_suite(workspace, &format!("baseline-{commit_id}"))?;
        let baseline = baseline_from_report(commit_id, Utc::now(), &report);
        if write_new(&path, &to_json_bytes(&baseline)?)? {
            info!(
                total = baseline.total,
                failing = baseline.failing,
                error = baseline.error,
                "baseline captured"
            );
            return Ok(baseline);
        }

        debug!("another writer captured this baseline first");
        read_json::<TestBaseline>(&path)?
            .with_context(|| format!("baseline {} vanished after publish", path.display()))
    }

    /// Run the full suite against the current state of `workspace`.
    pub fn run_current(&self, workspace: &Path) -> Result<TestReport> {
        self.run_suite(workspace, "current")
    }

    /// Classify `report` against `baseline` without retrying anything:
    /// every new failure counts as persistent.
    pub fn diff(&self, baseline: &TestBaseline, report: &TestReport) -> TestDelta {
        let candidates = delta::candidates(baseline, report);
        delta::classify(baseline, &candidates, &BTreeMap::new(), &self.thresholds)
    }

    /// Retry `ids` once at `commit_id`.
    ///
    /// Ids already retried at this commit are answered from the retry ledger
    /// and never executed again. Ids the retry did not report are recorded
    /// as errors.
    #[instrument(skip_all, fields(run_id = %self.artifacts.run_id(), commit_id = %commit_id, requested = ids.len()))]
    pub fn retry_newly_failing(
        &self,
        workspace: &Path,
        commit_id: &str,
        ids: &[String],
    ) -> Result<BTreeMap<String, TestOutcome>> {
        let ledger_path = self.artifacts.retry_ledger_path(commit_id)?;
        let mut ledger: BTreeMap<String, TestOutcome> =
            read_json(&ledger_path)?.unwrap_or_default();

        let mut pending: Vec<String> = ids
            .iter()
            .filter(|id| !ledger.contains_key(*id))
            .cloned()
            .collect();
        pending.sort();
        pending.dedup();

        if pending.is_empty() {
            debug!("all requested ids already retried at this commit");
        } else {
            info!(ids = ?pending, "retrying newly failing tests once");
            let request = TestRunRequest {
                workdir: workspace.to_path_buf(),
                report_path: self.artifacts.report_path("retry"),
                log_path: self.artifacts.retry_log_path(),
                ids: Some(pending.clone()),
                limits: self.retry_limits,
            };
            let outcomes = self.runner.run(&request)?.outcomes();
            for id in pending {
                let outcome = match outcomes.get(&id) {
                    Some(outcome) => *outcome,
                    None => {
                        warn!(test_id = %id, "retry did not report test, keeping it persistent");
                        TestOutcome::Error
                    }
                };
                ledger.insert(id, outcome);
            }
            write_json_atomic(&ledger_path, &ledger)?;
        }

        Ok(ids
            .iter()
            .filter_map(|id| ledger.get(id).map(|outcome| (id.clone(), *outcome)))
            .collect())
    }

    /// Full run of the current state plus the single retry of whatever broke
    /// since `baseline`.
    pub fn collect_ci(
        &self,
        workspace: &Path,
        commit_id: &str,
        baseline: &TestBaseline,
    ) -> Result<CiResult> {
        let report = self.run_current(workspace)?;
        let candidates = delta::candidates(baseline, &report);
        let retry_outcomes = if candidates.is_empty() {
            BTreeMap::new()
        } else {
            self.retry_newly_failing(workspace, commit_id, &candidates.retry_ids())?
        };
        Ok(CiResult {
            report,
            retry_outcomes,
        })
    }

    fn run_suite(&self, workspace: &Path, label: &str) -> Result<TestReport> {
        let request = TestRunRequest {
            workdir: workspace.to_path_buf(),
            report_path: self.artifacts.report_path(label),
            log_path: self.artifacts.tests_log_path(),
            ids: None,
            limits: self.suite_limits,
        };
        self.runner.run(&request)
    }
}
