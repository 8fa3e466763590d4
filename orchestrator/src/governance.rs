//! Governance request handling for writes outside a phase's scope.
//!
//! `NONE -> PENDING -> {AUTO_APPROVED | AWAITING_APPROVAL}
//!  -> {APPROVED -> RETRIED | DENIED}`
//!
//! Every transition is appended to the shared ledger and mirrored to the
//! run-scoped `governance/{request_id}.json`.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::core::policy::{GovernancePolicy, RequestedChange};
use crate::core::types::{GovernanceRequest, GovernanceState};
use crate::io::approval::ApprovalChannel;
use crate::io::artifacts::{RunArtifacts, write_json_atomic};
use crate::io::ledger::GovernanceLedger;
use crate::io::run_state::{AwaitingApproval, RunRecord};

/// Approver recorded when the policy auto-approves.
pub const AUTO_APPROVER: &str = "policy:auto";
/// Approver recorded when no decision arrived in time.
pub const TIMEOUT_APPROVER: &str = "orchestrator:timeout";
/// Approver recorded when handling failed before a decision was stored.
pub const ERROR_APPROVER: &str = "orchestrator:error";

/// How a governance request ended for the blocked write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GovernanceOutcome {
    /// The write may be retried once under a request-scoped allowance.
    Granted(GovernanceRequest),
    /// Denied, explicitly or by timeout. The phase must block.
    Denied(GovernanceRequest),
}

impl GovernanceOutcome {
    pub fn request(&self) -> &GovernanceRequest {
        match self {
            Self::Granted(request) | Self::Denied(request) => request,
        }
    }
}

pub struct GovernanceHandler<'a> {
    policy: &'a GovernancePolicy,
    ledger: &'a GovernanceLedger,
    approvals: &'a dyn ApprovalChannel,
    artifacts: &'a RunArtifacts,
}

impl<'a> GovernanceHandler<'a> {
    pub fn new(
        policy: &'a GovernancePolicy,
        ledger: &'a GovernanceLedger,
        approvals: &'a dyn ApprovalChannel,
        artifacts: &'a RunArtifacts,
    ) -> Self {
        Self {
            policy,
            ledger,
            approvals,
            artifacts,
        }
    }

    /// Open a request for `blocked` writes and drive it to a resolution.
    ///
    /// Blocks the calling phase while waiting for out-of-band approval,
    /// bounded by the approval channel's timeout; `run.json` shows the wait.
    /// An error after the request is opened resolves it DENIED by
    /// [`ERROR_APPROVER`] before propagating.
    pub fn handle_violation(
        &self,
        phase_id: &str,
        blocked: &[RequestedChange],
        justification: &str,
    ) -> Result<GovernanceOutcome> {
        if blocked.is_empty() {
            return Err(anyhow!("governance request needs at least one blocked path"));
        }
        let verdict = self.policy.evaluate(blocked);
        let request = GovernanceRequest {
            request_id: format!("gov-{}", Uuid::new_v4().simple()),
            run_id: self.artifacts.run_id().to_string(),
            phase_id: phase_id.to_string(),
            requested_paths: blocked.iter().map(|c| c.path.clone()).collect(),
            justification: justification.trim().to_string(),
            risk_level: verdict.risk_level,
            auto_approved: false,
            approved: None,
            approved_by: None,
            created_at: Utc::now(),
            state: GovernanceState::Pending,
            rationale: verdict.rationale,
            diff_lines: blocked.iter().map(|c| c.diff_lines).sum(),
            resolved_at: None,
        };
        self.ledger.open_request(&request)?;
        info!(
            request_id = %request.request_id,
            phase_id,
            paths = ?request.requested_paths,
            risk = %request.risk_level,
            auto_approve = verdict.auto_approve,
            "scope violation intercepted"
        );

        let request_id = request.request_id.clone();
        match self.drive_request(request, verdict.auto_approve) {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                match self.deny_after_error(&request_id) {
                    Ok(_) => warn!(
                        request_id = %request_id,
                        err = %err,
                        "governance handling failed, request denied"
                    ),
                    Err(close_err) => error!(
                        request_id = %request_id,
                        err = %close_err,
                        "could not close governance request after a failure"
                    ),
                }
                Err(err)
            }
        }
    }

    fn drive_request(
        &self,
        mut request: GovernanceRequest,
        auto_approve: bool,
    ) -> Result<GovernanceOutcome> {
        self.mirror(&request)?;
        if auto_approve {
            request.state = GovernanceState::AutoApproved;
            request.auto_approved = true;
            request.approved = Some(true);
            request.approved_by = Some(AUTO_APPROVER.to_string());
            request.resolved_at = Some(Utc::now());
            self.ledger.record_transition(&request)?;
            self.mirror(&request)?;
            return Ok(GovernanceOutcome::Granted(request));
        }

        request.state = GovernanceState::AwaitingApproval;
        self.ledger.record_transition(&request)?;
        self.mirror(&request)?;

        RunRecord::mark_awaiting(
            self.artifacts,
            Some(AwaitingApproval {
                phase_id: request.phase_id.clone(),
                request_id: request.request_id.clone(),
                since: Utc::now(),
            }),
        )?;
        let response = self.approvals.request_approval(&request);
        RunRecord::mark_awaiting(self.artifacts, None)?;
        let response = response?;
        let resolved = self.record_decision(&request, response.map(|r| (r.approved, r.by)))?;
        self.mirror(&resolved)?;
        if resolved.approved == Some(true) {
            Ok(GovernanceOutcome::Granted(resolved))
        } else {
            warn!(request_id = %resolved.request_id, by = ?resolved.approved_by, "governance request denied");
            Ok(GovernanceOutcome::Denied(resolved))
        }
    }

    /// Close a request whose handling failed so the phase is not left with
    /// an open request. Already resolved requests are left alone.
    fn deny_after_error(&self, request_id: &str) -> Result<GovernanceRequest> {
        let current = self
            .ledger
            .find(request_id)?
            .with_context(|| format!("governance request {request_id} missing"))?;
        if !current.is_open() {
            return Ok(current);
        }
        if current.state == GovernanceState::Pending {
            let mut awaiting = current;
            awaiting.state = GovernanceState::AwaitingApproval;
            self.ledger.record_transition(&awaiting)?;
        }
        let denied = self.ledger.resolve(request_id, false, ERROR_APPROVER)?;
        self.mirror(&denied)?;
        Ok(denied)
    }

    /// Mark a granted request as retried. Called after the single retry of
    /// the blocked write, whatever its result.
    pub fn complete_retry(&self, request: &GovernanceRequest) -> Result<GovernanceRequest> {
        let mut next = request.clone();
        next.state = GovernanceState::Retried;
        self.ledger.record_transition(&next)?;
        self.mirror(&next)?;
        Ok(next)
    }

    /// Persist the channel's answer unless someone already resolved the
    /// request in the ledger; a timeout becomes a denial.
    fn record_decision(
        &self,
        request: &GovernanceRequest,
        decision: Option<(bool, String)>,
    ) -> Result<GovernanceRequest> {
        let current = self
            .ledger
            .find(&request.request_id)?
            .with_context(|| format!("governance request {} missing", request.request_id))?;
        if current.state != GovernanceState::AwaitingApproval {
            return Ok(current);
        }
        let (approved, by) = decision.unwrap_or_else(|| (false, TIMEOUT_APPROVER.to_string()));
        match self.ledger.resolve(&request.request_id, approved, &by) {
            Ok(resolved) => Ok(resolved),
            // Lost a race with an out-of-band decision; the ledger has it.
            Err(err) => match self.ledger.find(&request.request_id)? {
                Some(current) if current.state != GovernanceState::AwaitingApproval => Ok(current),
                _ => Err(err),
            },
        }
    }

    fn mirror(&self, request: &GovernanceRequest) -> Result<()> {
        write_json_atomic(&self.artifacts.governance_path(&request.request_id)?, request)
    }
}

/// Requests awaiting a decision, oldest first.
pub fn list_pending(run_root: &Path) -> Result<Vec<GovernanceRequest>> {
    GovernanceLedger::new(run_root).list_pending()
}

pub fn show(run_root: &Path, request_id: &str) -> Result<Option<GovernanceRequest>> {
    GovernanceLedger::new(run_root).find(request_id)
}

pub fn approve(run_root: &Path, request_id: &str, by: &str) -> Result<GovernanceRequest> {
    resolve(run_root, request_id, true, by)
}

pub fn deny(run_root: &Path, request_id: &str, by: &str) -> Result<GovernanceRequest> {
    resolve(run_root, request_id, false, by)
}

fn resolve(run_root: &Path, request_id: &str, approved: bool, by: &str) -> Result<GovernanceRequest> {
    let resolved = GovernanceLedger::new(run_root).resolve(request_id, approved, by)?;
    let artifacts = RunArtifacts::new(run_root, &resolved.run_id)?;
    write_json_atomic(&artifacts.governance_path(&resolved.request_id)?, &resolved)?;
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ChangeKind, RiskLevel};
    use crate::error::GovernanceConflict;
    use crate::io::approval::ApprovalResponse;
    use crate::io::artifacts::read_json;
    use crate::io::config::GovernanceConfig;
    use crate::test_support::ScriptedApproval;

    struct BrokenChannel;

    /// Captures the run record as seen while a decision is pending.
    struct RecordingChannel {
        artifacts: RunArtifacts,
        seen: std::sync::Mutex<Option<RunRecord>>,
    }

    impl ApprovalChannel for RecordingChannel {
        fn request_approval(&self, _request: &GovernanceRequest) -> Result<Option<ApprovalResponse>> {
            *self.seen.lock().expect("seen") = RunRecord::load(&self.artifacts)?;
            Ok(None)
        }
    }

    impl ApprovalChannel for BrokenChannel {
        fn request_approval(&self, _request: &GovernanceRequest) -> Result<Option<ApprovalResponse>> {
            Err(anyhow!("approval inbox unreachable"))
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        run_root: std::path::PathBuf,
        policy: GovernancePolicy,
        ledger: GovernanceLedger,
        artifacts: RunArtifacts,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_root = temp.path().join("runs");
        let artifacts = RunArtifacts::new(&run_root, "run-1").expect("artifacts");
        artifacts.ensure_layout().expect("layout");
        Fixture {
            policy: GovernanceConfig::default().policy().expect("policy"),
            ledger: GovernanceLedger::new(&run_root),
            artifacts,
            run_root,
            _temp: temp,
        }
    }

    fn change(path: &str, kind: ChangeKind, lines: usize) -> RequestedChange {
        RequestedChange {
            path: path.to_string(),
            kind,
            diff_lines: lines,
        }
    }

    #[test]
    fn additive_test_is_auto_approved_without_asking() {
        let f = fixture();
        let approvals = ScriptedApproval::never();
        let handler = GovernanceHandler::new(&f.policy, &f.ledger, &approvals, &f.artifacts);
        let outcome = handler
            .handle_violation("p1", &[change("tests/new_case.rs", ChangeKind::Create, 10)], "add test")
            .expect("handle");
        let GovernanceOutcome::Granted(request) = outcome else {
            panic!("expected grant");
        };
        assert!(request.auto_approved);
        assert_eq!(request.state, GovernanceState::AutoApproved);
        assert_eq!(approvals.calls(), 0);

        let retried = handler.complete_retry(&request).expect("retry");
        assert_eq!(retried.state, GovernanceState::Retried);
        let mirrored: GovernanceRequest =
            read_json(&f.artifacts.governance_path(&request.request_id).expect("path"))
                .expect("read")
                .expect("present");
        assert_eq!(mirrored.state, GovernanceState::Retried);
    }

    #[test]
    fn control_plane_path_is_never_auto_approved() {
        let f = fixture();
        let approvals = ScriptedApproval::never();
        let handler = GovernanceHandler::new(&f.policy, &f.ledger, &approvals, &f.artifacts);
        let outcome = handler
            .handle_violation(
                "p1",
                &[change("orchestrator/src/io/ledger.rs", ChangeKind::Modify, 1)],
                "trivial, trust me",
            )
            .expect("handle");
        let GovernanceOutcome::Denied(request) = outcome else {
            panic!("expected denial");
        };
        assert_eq!(request.risk_level, RiskLevel::Critical);
        assert!(!request.auto_approved);
        assert_eq!(request.approved_by.as_deref(), Some(TIMEOUT_APPROVER));
        assert!(request.rationale.iter().any(|r| r.contains("protected")));
        assert_eq!(approvals.calls(), 1);
    }

    #[test]
    fn human_approval_grants_the_request() {
        let f = fixture();
        let approvals = ScriptedApproval::responding(ApprovalResponse {
            approved: true,
            by: "alice".to_string(),
        });
        let handler = GovernanceHandler::new(&f.policy, &f.ledger, &approvals, &f.artifacts);
        let outcome = handler
            .handle_violation("p1", &[change("Cargo.toml", ChangeKind::Modify, 2)], "dep bump")
            .expect("handle");
        let GovernanceOutcome::Granted(request) = outcome else {
            panic!("expected grant");
        };
        assert_eq!(request.state, GovernanceState::Approved);
        assert_eq!(request.approved_by.as_deref(), Some("alice"));
        assert!(list_pending(&f.run_root).expect("pending").is_empty());
    }

    #[test]
    fn second_open_request_for_the_phase_conflicts() {
        let f = fixture();
        let mut stuck = GovernanceRequest {
            request_id: "gov-open".to_string(),
            run_id: "run-1".to_string(),
            phase_id: "p1".to_string(),
            requested_paths: vec!["Cargo.toml".to_string()],
            justification: String::new(),
            risk_level: RiskLevel::Medium,
            auto_approved: false,
            approved: None,
            approved_by: None,
            created_at: Utc::now(),
            state: GovernanceState::Pending,
            rationale: Vec::new(),
            diff_lines: 1,
            resolved_at: None,
        };
        f.ledger.open_request(&stuck).expect("open");
        stuck.state = GovernanceState::AwaitingApproval;
        f.ledger.record_transition(&stuck).expect("await");

        let approvals = ScriptedApproval::never();
        let handler = GovernanceHandler::new(&f.policy, &f.ledger, &approvals, &f.artifacts);
        let err = handler
            .handle_violation("p1", &[change("Cargo.toml", ChangeKind::Modify, 1)], "")
            .expect_err("conflict");
        assert!(err.downcast_ref::<GovernanceConflict>().is_some());

        let approved = approve(&f.run_root, "gov-open", "bob").expect("approve");
        assert_eq!(approved.state, GovernanceState::Approved);
        assert!(show(&f.run_root, "gov-open").expect("show").is_some());
        assert!(deny(&f.run_root, "gov-open", "carol").is_err());
    }

    #[test]
    fn channel_failure_denies_the_request_and_frees_the_phase() {
        let f = fixture();
        let handler = GovernanceHandler::new(&f.policy, &f.ledger, &BrokenChannel, &f.artifacts);
        let err = handler
            .handle_violation("p1", &[change("Cargo.toml", ChangeKind::Modify, 2)], "dep bump")
            .expect_err("channel failure");
        assert!(format!("{err:#}").contains("approval inbox unreachable"));

        assert!(list_pending(&f.run_root).expect("pending").is_empty());
        let snapshot = f.ledger.snapshot().expect("ledger");
        let denied = snapshot
            .requests()
            .find(|r| r.phase_id == "p1")
            .cloned()
            .expect("request recorded");
        assert_eq!(denied.state, GovernanceState::Denied);
        assert_eq!(denied.approved_by.as_deref(), Some(ERROR_APPROVER));
        let mirrored: GovernanceRequest =
            read_json(&f.artifacts.governance_path(&denied.request_id).expect("path"))
                .expect("read")
                .expect("present");
        assert_eq!(mirrored.state, GovernanceState::Denied);

        let approvals = ScriptedApproval::never();
        let handler = GovernanceHandler::new(&f.policy, &f.ledger, &approvals, &f.artifacts);
        let outcome = handler
            .handle_violation("p1", &[change("Cargo.toml", ChangeKind::Modify, 2)], "dep bump")
            .expect("no conflict after the failed request");
        assert!(matches!(outcome, GovernanceOutcome::Denied(_)));
    }

    #[test]
    fn run_record_shows_the_phase_awaiting_approval() {
        let f = fixture();
        RunRecord::start("run-1").save(&f.artifacts).expect("record");
        let channel = RecordingChannel {
            artifacts: f.artifacts.clone(),
            seen: std::sync::Mutex::new(None),
        };
        let handler = GovernanceHandler::new(&f.policy, &f.ledger, &channel, &f.artifacts);
        let outcome = handler
            .handle_violation("p1", &[change("Cargo.toml", ChangeKind::Modify, 2)], "dep bump")
            .expect("handle");

        let seen = channel.seen.lock().expect("seen").clone().expect("record while waiting");
        let awaiting = seen.awaiting_approval.expect("marker while waiting");
        assert_eq!(awaiting.phase_id, "p1");
        assert_eq!(awaiting.request_id, outcome.request().request_id);

        let after = RunRecord::load(&f.artifacts).expect("load").expect("record");
        assert!(after.awaiting_approval.is_none());
    }
}
