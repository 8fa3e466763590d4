//! Typed errors callers branch on.
//!
//! Everything else travels as `anyhow::Error` with context. These types are
//! carried inside `anyhow::Error` and recovered with `downcast_ref`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::core::types::PhaseStatus;

/// The structured test runner did not finish within its budget.
#[derive(Debug, Error)]
#[error("test suite timed out after {}s in {}", .timeout.as_secs(), .workdir.display())]
pub struct SuiteTimeout {
    pub workdir: PathBuf,
    pub timeout: Duration,
}

/// Who holds a contended lock, when the holder record is readable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HolderInfo {
    pub pid: u32,
    pub run_id: Option<String>,
    pub acquired_at: String,
}

/// A lease or execution lock is held by someone else.
#[derive(Debug, Error)]
#[error("{kind} '{key}' is held{} (waited {}ms)", describe_holder(.holder), .waited.as_millis())]
pub struct LockContended {
    pub kind: &'static str,
    pub key: String,
    pub holder: Option<HolderInfo>,
    pub waited: Duration,
}

fn describe_holder(holder: &Option<HolderInfo>) -> String {
    match holder {
        Some(h) => match &h.run_id {
            Some(run_id) => format!(
                " by pid {} (run {run_id}, since {})",
                h.pid, h.acquired_at
            ),
            None => format!(" by pid {} (since {})", h.pid, h.acquired_at),
        },
        None => String::new(),
    }
}

/// More than one run was requested without a valid parallel authorization.
#[derive(Debug, Error)]
#[error(
    "refusing to start {requested} concurrent runs: {reason} \
     (pass an authorization artifact listing every run id, or run them one at a time)"
)]
pub struct ParallelNotAuthorized {
    pub requested: usize,
    pub reason: String,
}

/// An unresolved governance request already exists for this run and phase.
#[derive(Debug, Error)]
#[error("governance request {request_id} is still open for run {run_id} phase {phase_id}")]
pub struct GovernanceConflict {
    pub request_id: String,
    pub run_id: String,
    pub phase_id: String,
}

/// A phase status change that the lifecycle does not allow.
#[derive(Debug, Error)]
#[error("phase {phase_id} cannot move from {from} to {to}")]
pub struct PhaseRejected {
    pub phase_id: String,
    pub from: PhaseStatus,
    pub to: PhaseStatus,
}

/// The run was aborted between phases.
#[derive(Debug, Error)]
#[error("run {run_id} aborted before phase {next_phase}")]
pub struct RunAborted {
    pub run_id: String,
    pub next_phase: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_message_names_the_holder() {
        let err = LockContended {
            kind: "execution lock",
            key: "run-1".to_string(),
            holder: Some(HolderInfo {
                pid: 42,
                run_id: Some("run-1".to_string()),
                acquired_at: "2026-01-01T00:00:00Z".to_string(),
            }),
            waited: Duration::from_millis(250),
        };
        let msg = err.to_string();
        assert!(msg.contains("pid 42"));
        assert!(msg.contains("run run-1"));
        assert!(msg.contains("250ms"));
    }

    #[test]
    fn parallel_refusal_is_actionable() {
        let err = ParallelNotAuthorized {
            requested: 3,
            reason: "no authorization artifact".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 concurrent runs"));
        assert!(msg.contains("authorization artifact"));
    }
}
