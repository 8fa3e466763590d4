//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::delta::SeverityThresholds;
use crate::core::policy::GovernancePolicy;
use crate::core::types::RiskLevel;
use crate::io::artifacts::write_atomic;
use crate::io::process::ProcessLimits;

/// Location of the config file relative to the repository root.
pub const CONFIG_RELATIVE_PATH: &str = ".orchestrator/config.toml";

/// Placeholder in `tests.command` replaced with the report path.
pub const REPORT_PLACEHOLDER: &str = "{report}";

/// Orchestrator configuration (TOML).
///
/// Policy values (deny-list, size threshold, severity thresholds) live here
/// so they can be overridden per repository. Missing fields take the
/// conservative defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Root of all run-scoped artifacts, relative to the repository root.
    pub run_root: PathBuf,
    /// Parent directory for per-run working copies, relative to the repository root.
    pub worktrees_dir: PathBuf,
    pub tests: TestsConfig,
    pub locks: LocksConfig,
    pub governance: GovernanceConfig,
    pub regression: SeverityThresholds,
    pub run: RunConfig,
    pub builder: AgentCommandConfig,
    pub auditor: AgentCommandConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestsConfig {
    /// Structured test runner argv; must contain `{report}`.
    pub command: Vec<String>,
    pub suite_timeout_secs: u64,
    /// Budget for the single retry of newly failing tests.
    pub retry_timeout_secs: u64,
    /// Truncate runner stdout/stderr logs beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "scripts/test-report".to_string(),
                "--report".to_string(),
                REPORT_PLACEHOLDER.to_string(),
            ],
            suite_timeout_secs: 30 * 60,
            retry_timeout_secs: 10 * 60,
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LocksConfig {
    pub lease_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            lease_timeout_ms: 10_000,
            lock_timeout_ms: 10_000,
            poll_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Never auto-approved, whatever the diff size or justification.
    pub protected_paths: Vec<String>,
    pub test_files: Vec<String>,
    pub doc_files: Vec<String>,
    pub max_auto_approve_lines: usize,
    pub max_auto_approve_risk: RiskLevel,
    pub approval_timeout_secs: u64,
    pub approval_poll_interval_ms: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            protected_paths: strings(&[
                ".git",
                ".orchestrator",
                "orchestrator/src",
                "orchestrator/schemas",
                "schemas",
                "**/migrations",
                "**/migrations/**",
                "**/.env",
                "**/.env.*",
                "**/*.pem",
                "**/*.key",
                "**/secrets",
                "**/secrets/**",
            ]),
            test_files: strings(&[
                "tests",
                "**/tests/**",
                "**/test_*.py",
                "**/*_test.py",
                "**/*_test.rs",
                "**/*_test.go",
                "**/*.test.ts",
                "**/*.spec.ts",
            ]),
            doc_files: strings(&["docs", "**/*.md", "**/*.rst", "**/*.txt"]),
            max_auto_approve_lines: 100,
            max_auto_approve_risk: RiskLevel::Medium,
            approval_timeout_secs: 15 * 60,
            approval_poll_interval_ms: 500,
        }
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl GovernanceConfig {
    pub fn policy(&self) -> Result<GovernancePolicy> {
        GovernancePolicy::new(
            &self.protected_paths,
            &self.test_files,
            &self.doc_files,
            self.max_auto_approve_lines,
            self.max_auto_approve_risk,
        )
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_secs)
    }

    pub fn approval_poll_interval(&self) -> Duration {
        Duration::from_millis(self.approval_poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RunConfig {
    /// Keep executing later phases after one ends BLOCKED or FAILED.
    pub continue_after_blocked: bool,
}

/// External agent invocation (argv + timeout).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentCommandConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl AgentCommandConfig {
    pub fn limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.timeout_secs),
            output_limit_bytes: self.output_limit_bytes,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            run_root: PathBuf::from(".orchestrator/runs"),
            worktrees_dir: PathBuf::from(".orchestrator/worktrees"),
            tests: TestsConfig::default(),
            locks: LocksConfig::default(),
            governance: GovernanceConfig::default(),
            regression: SeverityThresholds::default(),
            run: RunConfig::default(),
            builder: AgentCommandConfig::default(),
            auditor: AgentCommandConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.run_root.as_os_str().is_empty() {
            return Err(anyhow!("run_root must not be empty"));
        }
        if self.worktrees_dir.as_os_str().is_empty() {
            return Err(anyhow!("worktrees_dir must not be empty"));
        }
        if self.tests.command.is_empty() || self.tests.command[0].trim().is_empty() {
            return Err(anyhow!("tests.command must be a non-empty array"));
        }
        if !self
            .tests
            .command
            .iter()
            .any(|arg| arg.contains(REPORT_PLACEHOLDER))
        {
            return Err(anyhow!(
                "tests.command must contain the {REPORT_PLACEHOLDER} placeholder"
            ));
        }
        if self.tests.suite_timeout_secs == 0 || self.tests.retry_timeout_secs == 0 {
            return Err(anyhow!("tests timeouts must be > 0"));
        }
        if self.tests.output_limit_bytes == 0 {
            return Err(anyhow!("tests.output_limit_bytes must be > 0"));
        }
        if self.locks.lease_timeout_ms == 0
            || self.locks.lock_timeout_ms == 0
            || self.locks.poll_interval_ms == 0
        {
            return Err(anyhow!("locks timeouts and poll interval must be > 0"));
        }
        if self.governance.approval_timeout_secs == 0
            || self.governance.approval_poll_interval_ms == 0
        {
            return Err(anyhow!(
                "governance approval timeout and poll interval must be > 0"
            ));
        }
        self.governance
            .policy()
            .context("governance path patterns")?;
        let r = &self.regression;
        let ordered = 0.0 < r.medium_ratio
            && r.medium_ratio <= r.high_ratio
            && r.high_ratio <= r.critical_ratio
            && r.critical_ratio <= 1.0;
        if !ordered {
            return Err(anyhow!(
                "regression ratios must satisfy 0 < medium <= high <= critical <= 1"
            ));
        }
        if r.critical_count == 0 {
            return Err(anyhow!("regression.critical_count must be > 0"));
        }
        for (name, agent) in [("builder", &self.builder), ("auditor", &self.auditor)] {
            if agent.timeout_secs == 0 || agent.output_limit_bytes == 0 {
                return Err(anyhow!("{name} timeout and output limit must be > 0"));
            }
        }
        Ok(())
    }

    pub fn run_root_in(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.run_root)
    }

    pub fn worktrees_dir_in(&self, repo_root: &Path) -> PathBuf {
        repo_root.join(&self.worktrees_dir)
    }

    pub fn suite_limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.tests.suite_timeout_secs),
            output_limit_bytes: self.tests.output_limit_bytes,
        }
    }

    pub fn retry_limits(&self) -> ProcessLimits {
        ProcessLimits {
            timeout: Duration::from_secs(self.tests.retry_timeout_secs),
            output_limit_bytes: self.tests.output_limit_bytes,
        }
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.locks.lease_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.locks.lock_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.locks.poll_interval_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, buf.as_bytes())
}
