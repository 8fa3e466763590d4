//! Durable per-run record (`{run_root}/{run_id}/run.json`).

use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::{PhaseFinalizationDecision, PhaseStatus};
use crate::io::artifacts::{RunArtifacts, read_json, write_json_atomic};

/// Terminal or in-flight status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Executing,
    Completed,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Executing)
    }
}

/// Outcome of one phase as recorded in the run record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub phase_id: String,
    pub status: PhaseStatus,
    pub can_complete: bool,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub governance_request_id: Option<String>,
    /// Working copy HEAD once the phase settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_commit: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl PhaseSummary {
    pub fn from_decision(
        decision: &PhaseFinalizationDecision,
        governance_request_id: Option<String>,
    ) -> Self {
        Self {
            phase_id: decision.phase_id.clone(),
            status: decision.status,
            can_complete: decision.can_complete,
            reason: decision.reason.clone(),
            governance_request_id,
            head_commit: None,
            finished_at: Utc::now(),
        }
    }

    pub fn with_head(mut self, head_commit: String) -> Self {
        self.head_commit = Some(head_commit);
        self
    }
}

/// A phase held on an out-of-band governance decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwaitingApproval {
    pub phase_id: String,
    pub request_id: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    /// Process that executed the run.
    #[serde(default)]
    pub worker_pid: u32,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub working_copy: Option<PathBuf>,
    #[serde(default)]
    pub base_commit: Option<String>,
    /// Last commit of the run's working copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_commit: Option<String>,
    /// Repository ref kept at `head_commit` after the working copy is gone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub phases: Vec<PhaseSummary>,
    /// Set while the executing phase waits for approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting_approval: Option<AwaitingApproval>,
    /// Environment or contention failure that ended the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn start(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            status: RunStatus::Executing,
            worker_pid: std::process::id(),
            started_at: Utc::now(),
            finished_at: None,
            working_copy: None,
            base_commit: None,
            head_commit: None,
            result_ref: None,
            phases: Vec::new(),
            awaiting_approval: None,
            error: None,
        }
    }

    pub fn finish(&mut self, status: RunStatus, error: Option<String>) {
        self.status = status;
        self.awaiting_approval = None;
        self.error = error;
        self.finished_at = Some(Utc::now());
    }

    pub fn save(&self, artifacts: &RunArtifacts) -> Result<()> {
        let path = artifacts.run_record_path();
        debug!(path = %path.display(), status = ?self.status, "writing run record");
        write_json_atomic(&path, self).with_context(|| format!("write run record {}", path.display()))
    }

    pub fn load(artifacts: &RunArtifacts) -> Result<Option<Self>> {
        read_json(&artifacts.run_record_path())
    }

    /// Set or clear the awaiting-approval marker of an existing record.
    /// Without a record (no supervised run) there is nothing to mark.
    pub fn mark_awaiting(artifacts: &RunArtifacts, awaiting: Option<AwaitingApproval>) -> Result<()> {
        let Some(mut record) = Self::load(artifacts)? else {
            return Ok(());
        };
        if record.awaiting_approval == awaiting {
            return Ok(());
        }
        record.awaiting_approval = awaiting;
        record.save(artifacts)
    }
}
