//! Out-of-band approval for governance requests.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, info};

use crate::core::types::{GovernanceRequest, GovernanceState};
use crate::io::ledger::GovernanceLedger;

/// A human or policy-service decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalResponse {
    pub approved: bool,
    pub by: String,
}

/// Seam for asking someone outside the run to approve a request.
pub trait ApprovalChannel {
    /// Block the calling phase until a decision arrives or the channel's
    /// timeout elapses. `Ok(None)` means no decision in time.
    fn request_approval(&self, request: &GovernanceRequest) -> Result<Option<ApprovalResponse>>;
}

/// Waits for an `approve`/`deny` row written to the ledger by another
/// process (normally the `governance` CLI).
#[derive(Debug, Clone)]
pub struct LedgerApprovalChannel {
    ledger: GovernanceLedger,
    timeout: Duration,
    poll_interval: Duration,
}

impl LedgerApprovalChannel {
    pub fn new(ledger: GovernanceLedger, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            ledger,
            timeout,
            poll_interval,
        }
    }
}

impl ApprovalChannel for LedgerApprovalChannel {
    fn request_approval(&self, request: &GovernanceRequest) -> Result<Option<ApprovalResponse>> {
        info!(
            request_id = %request.request_id,
            paths = ?request.requested_paths,
            timeout_secs = self.timeout.as_secs(),
            "waiting for governance approval (orchestrator governance approve|deny {})",
            request.request_id
        );
        let start = Instant::now();
        loop {
            if let Some(current) = self.ledger.find(&request.request_id)? {
                let decided = match current.state {
                    GovernanceState::Approved => Some(true),
                    GovernanceState::Denied => Some(false),
                    _ => None,
                };
                if let Some(approved) = decided {
                    debug!(request_id = %request.request_id, approved, "decision observed");
                    return Ok(Some(ApprovalResponse {
                        approved,
                        by: current.approved_by.unwrap_or_default(),
                    }));
                }
            }
            let waited = start.elapsed();
            if waited >= self.timeout {
                return Ok(None);
            }
            thread::sleep(self.poll_interval.min(self.timeout - waited));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RiskLevel;
    use chrono::Utc;

    fn awaiting_request(ledger: &GovernanceLedger) -> GovernanceRequest {
        let mut req = GovernanceRequest {
            request_id: "gov-1".to_string(),
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
        ledger.open_request(&req).expect("open");
        req.state = GovernanceState::AwaitingApproval;
        ledger.record_transition(&req).expect("await");
        req
    }

    #[test]
    fn observes_an_approval_written_by_another_writer() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = GovernanceLedger::new(temp.path());
        let req = awaiting_request(&ledger);
        let channel = LedgerApprovalChannel::new(
            ledger.clone(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        );

        let response = thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                ledger.resolve("gov-1", true, "alice").expect("approve");
            });
            channel.request_approval(&req).expect("wait")
        });
        assert_eq!(
            response,
            Some(ApprovalResponse {
                approved: true,
                by: "alice".to_string()
            })
        );
    }

    #[test]
    fn times_out_without_a_decision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = GovernanceLedger::new(temp.path());
        let req = awaiting_request(&ledger);
        let channel =
            LedgerApprovalChannel::new(ledger, Duration::from_millis(60), Duration::from_millis(10));
        assert_eq!(channel.request_approval(&req).expect("wait"), None);
    }
}
