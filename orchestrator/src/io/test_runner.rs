//! Structured test runner invocation.
//!
//! The runner is an external process. It is told where to write its report
//! through the `{report}` placeholder; ids for a partial run are appended as
//! trailing arguments.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::TestReport;
use crate::error::SuiteTimeout;
use crate::io::artifacts::write_atomic;
use crate::io::config::REPORT_PLACEHOLDER;
use crate::io::process::{ProcessLimits, run_command_with_timeout};
use crate::io::report::load_report;

/// One invocation of the test runner.
#[derive(Debug, Clone)]
pub struct TestRunRequest {
    pub workdir: PathBuf,
    pub report_path: PathBuf,
    pub log_path: PathBuf,
    /// `None` runs the full suite.
    pub ids: Option<Vec<String>>,
    pub limits: ProcessLimits,
}

/// Seam for running the test suite (real process or scripted fake).
pub trait TestRunner {
    /// Run the suite and return its structured report.
    ///
    /// A timeout is a [`SuiteTimeout`] error, never an empty report.
    fn run(&self, request: &TestRunRequest) -> Result<TestReport>;
}

/// Runs the configured command as a child process.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: Vec<String>,
}

impl CommandTestRunner {
    pub fn new(command: Vec<String>) -> Result<Self> {
        if command.is_empty() {
            return Err(anyhow!("test runner command must not be empty"));
        }
        Ok(Self { command })
    }

    fn argv(&self, report_path: &Path, ids: Option<&[String]>) -> Vec<String> {
        let report = report_path.to_string_lossy();
        let mut argv: Vec<String> = self
            .command
            .iter()
            .map(|arg| arg.replace(REPORT_PLACEHOLDER, &report))
            .collect();
        if let Some(ids) = ids {
            argv.extend(ids.iter().cloned());
        }
        argv
    }
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(workdir = %request.workdir.display(), subset = request.ids.as_ref().map(Vec::len)))]
    fn run(&self, request: &TestRunRequest) -> Result<TestReport> {
        match fs::remove_file(&request.report_path) {
            Ok(()) => debug!("removed stale report"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| {
                    format!("remove stale report {}", request.report_path.display())
                });
            }
        }
        if let Some(parent) = request.report_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        let argv = self.argv(&request.report_path, request.ids.as_deref());
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).current_dir(&request.workdir);

        info!("running test suite");
        let output = run_command_with_timeout(cmd, None, request.limits)?;
        write_atomic(
            &request.log_path,
            output.render_log("test runner").as_bytes(),
        )?;

        if output.timed_out {
            warn!("test suite timed out");
            return Err(SuiteTimeout {
                workdir: request.workdir.clone(),
                timeout: request.limits.timeout,
            }
            .into());
        }
        if !request.report_path.exists() {
            return Err(anyhow!(
                "test runner exited with {:?} without writing a report to {} (log: {})",
                output.status.code(),
                request.report_path.display(),
                request.log_path.display()
            ));
        }
        let report = load_report(&request.report_path)?;
        debug!(tests = report.tests.len(), exit_code = ?output.status.code(), "test report loaded");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TestOutcome;
    use std::time::Duration;

    fn request(dir: &Path, ids: Option<Vec<String>>, timeout_ms: u64) -> TestRunRequest {
        TestRunRequest {
            workdir: dir.to_path_buf(),
            report_path: dir.join("out/report.json"),
            log_path: dir.join("out/tests.log"),
            ids,
            limits: ProcessLimits {
                timeout: Duration::from_millis(timeout_ms),
                output_limit_bytes: 10_000,
            },
        }
    }

    fn shell(script: &str) -> CommandTestRunner {
        CommandTestRunner::new(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "runner".to_string(),
            REPORT_PLACEHOLDER.to_string(),
        ])
        .expect("runner")
    }

    #[test]
    fn loads_the_report_even_when_the_suite_fails() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = shell(
            r#"printf '{"tests":[{"id":"a","outcome":"failed"}]}' > "$1"; echo noise; exit 1"#,
        );
        let report = runner
            .run(&request(temp.path(), None, 5_000))
            .expect("run");
        assert_eq!(report.tests[0].outcome, TestOutcome::Failed);
        let log = fs::read_to_string(temp.path().join("out/tests.log")).expect("log");
        assert!(log.contains("noise"));
    }

    #[test]
    fn appends_requested_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = shell(
            r#"report="$1"; shift; printf '{"tests":[{"id":"%s","outcome":"passed"}]}' "$*" > "$report""#,
        );
        let ids = vec!["t1".to_string(), "t2".to_string()];
        let report = runner
            .run(&request(temp.path(), Some(ids), 5_000))
            .expect("run");
        assert_eq!(report.tests[0].id, "t1 t2");
    }

    #[test]
    fn missing_report_is_an_error_not_an_empty_suite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = shell("echo '5 passed'")
            .run(&request(temp.path(), None, 5_000))
            .expect_err("no report");
        assert!(err.to_string().contains("without writing a report"));
    }

    #[test]
    fn timeout_is_reported_as_suite_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = shell("exec sleep 5")
            .run(&request(temp.path(), None, 100))
            .expect_err("timeout");
        assert!(err.downcast_ref::<SuiteTimeout>().is_some());
    }

    #[test]
    fn stale_report_from_a_previous_run_is_not_reused() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path(), None, 5_000);
        fs::create_dir_all(temp.path().join("out")).expect("mkdir");
        fs::write(&req.report_path, r#"{"tests":[]}"#).expect("stale");
        assert!(shell("true").run(&req).is_err());
    }
}
