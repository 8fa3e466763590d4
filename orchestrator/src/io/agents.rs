//! External Builder and Auditor collaborators.
//!
//! The orchestrator never authors or scores patches itself. It hands the
//! phase to a Builder and the resulting proposal to an Auditor, both behind
//! traits so tests use scripted fakes and production spawns commands.

use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{Phase, Proposal, ReviewVerdict};
use crate::io::config::AgentCommandConfig;
use crate::io::process::run_command_with_timeout;

/// Produces a candidate change set for a phase.
pub trait Builder {
    fn propose(&self, phase: &Phase, workdir: &Path) -> Result<Proposal>;
}

/// Scores a candidate change set.
pub trait Auditor {
    fn review(&self, proposal: &Proposal, phase: &Phase, workdir: &Path) -> Result<ReviewVerdict>;
}

#[derive(Serialize)]
struct BuilderInput<'a> {
    phase: &'a Phase,
}

#[derive(Serialize)]
struct AuditorInput<'a> {
    phase: &'a Phase,
    proposal: &'a Proposal,
}

/// Builder that spawns the configured command: phase JSON on stdin,
/// proposal JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    config: AgentCommandConfig,
}

impl CommandBuilder {
    pub fn new(config: AgentCommandConfig) -> Result<Self> {
        ensure_command("builder", &config)?;
        Ok(Self { config })
    }
}

impl Builder for CommandBuilder {
    fn propose(&self, phase: &Phase, workdir: &Path) -> Result<Proposal> {
        let proposal: Proposal =
            run_agent("builder", &self.config, workdir, &BuilderInput { phase })?;
        info!(phase_id = %phase.phase_id, changes = proposal.changes.len(), "builder proposed changes");
        Ok(proposal)
    }
}

/// Auditor that spawns the configured command: phase and proposal JSON on
/// stdin, verdict JSON on stdout.
#[derive(Debug, Clone)]
pub struct CommandAuditor {
    config: AgentCommandConfig,
}

impl CommandAuditor {
    pub fn new(config: AgentCommandConfig) -> Result<Self> {
        ensure_command("auditor", &config)?;
        Ok(Self { config })
    }
}

impl Auditor for CommandAuditor {
    fn review(&self, proposal: &Proposal, phase: &Phase, workdir: &Path) -> Result<ReviewVerdict> {
        let verdict: ReviewVerdict = run_agent(
            "auditor",
            &self.config,
            workdir,
            &AuditorInput { phase, proposal },
        )?;
        info!(phase_id = %phase.phase_id, verdict = %verdict.verdict, blocking = verdict.blocking, "auditor verdict");
        Ok(verdict)
    }
}

fn ensure_command(label: &str, config: &AgentCommandConfig) -> Result<()> {
    if config.command.is_empty() || config.command[0].trim().is_empty() {
        return Err(anyhow!("{label}.command must be configured"));
    }
    Ok(())
}

#[instrument(skip_all, fields(agent = label, workdir = %workdir.display()))]
fn run_agent<I: Serialize, T: DeserializeOwned>(
    label: &str,
    config: &AgentCommandConfig,
    workdir: &Path,
    input: &I,
) -> Result<T> {
    ensure_command(label, config)?;
    let payload = serde_json::to_vec(input).with_context(|| format!("serialize {label} input"))?;
    let mut cmd = Command::new(&config.command[0]);
    cmd.args(&config.command[1..]).current_dir(workdir);

    let output = run_command_with_timeout(cmd, Some(payload.as_slice()), config.limits())
        .with_context(|| format!("run {label}"))?;
    if output.timed_out {
        warn!("{label} timed out");
        return Err(anyhow!(
            "{label} timed out after {}s",
            config.timeout_secs
        ));
    }
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow!(
            "{label} failed with status {:?}: {}",
            output.status.code(),
            stderr.trim()
        ));
    }
    if output.stdout_truncated > 0 {
        return Err(anyhow!(
            "{label} output exceeded {} bytes",
            config.output_limit_bytes
        ));
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!(bytes = output.stdout.len(), "{label} finished");
    serde_json::from_str(stdout.trim()).with_context(|| format!("parse {label} output json"))
}
