//! Several runs at once: authorization, isolation and contention.

use std::collections::BTreeSet;
use std::fs;

use orchestrator::core::authorization::ParallelAuthorization;
use orchestrator::error::{LockContended, ParallelNotAuthorized};
use orchestrator::io::config::OrchestratorConfig;
use orchestrator::io::exec_lock::ExecutorLock;
use orchestrator::io::run_state::RunStatus;
use orchestrator::supervisor::{Collaborators, RunPlan, RunSupervisor, request_abort};
use orchestrator::test_support::{
    ScriptedApproval, ScriptedAuditor, ScriptedBuilder, ScriptedTestRunner, TestRepo, create,
    phase, proposal, scope, suite,
};

fn config(repo: &TestRepo) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.run_root = repo.scratch_dir().join("runs");
    config.worktrees_dir = repo.scratch_dir().join("worktrees");
    config.locks.lease_timeout_ms = 200;
    config.locks.lock_timeout_ms = 200;
    config.locks.poll_interval_ms = 10;
    config
}

fn plan(run_id: &str) -> RunPlan {
    RunPlan {
        run_id: run_id.to_string(),
        base_rev: "HEAD".to_string(),
        phases: vec![phase("p1", scope(&["src"]))],
    }
}

fn grant(run_ids: &[&str]) -> ParallelAuthorization {
    ParallelAuthorization {
        granted_by: "ops".to_string(),
        run_ids: run_ids.iter().map(|s| s.to_string()).collect(),
        max_workers: run_ids.len(),
        expires_at: None,
    }
}

struct Fakes {
    builder: ScriptedBuilder,
    auditor: ScriptedAuditor,
    tests: ScriptedTestRunner,
    approvals: ScriptedApproval,
}

impl Fakes {
    fn new() -> Self {
        Self {
            builder: ScriptedBuilder::new().with(
                "p1",
                proposal(vec![create("src/lib.rs", "pub fn f() {}\n")], "add lib"),
            ),
            auditor: ScriptedAuditor::approving(),
            tests: ScriptedTestRunner::new(vec![suite(5, &[], &[])]),
            approvals: ScriptedApproval::never(),
        }
    }

    fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            builder: &self.builder,
            auditor: &self.auditor,
            tests: &self.tests,
            approvals: &self.approvals,
        }
    }
}

#[test]
fn several_plans_without_authorization_never_start() {
    let repo = TestRepo::new().expect("repo");
    let config = config(&repo);
    let fakes = Fakes::new();
    let supervisor = RunSupervisor::new(repo.path(), &config, fakes.collaborators());

    let plans = vec![plan("run-a"), plan("run-b"), plan("run-c")];
    let err = supervisor
        .execute_runs_in_parallel(&plans, None)
        .expect_err("unauthorized");
    let refused = err
        .downcast_ref::<ParallelNotAuthorized>()
        .expect("typed refusal");
    assert_eq!(refused.requested, 3);
    assert_eq!(fakes.builder.calls(), 0);
    assert_eq!(fakes.tests.full_calls(), 0);
    assert!(!config.worktrees_dir.exists(), "no working copy was created");
}

#[test]
fn authorization_must_cover_every_run() {
    let repo = TestRepo::new().expect("repo");
    let config = config(&repo);
    let fakes = Fakes::new();
    let supervisor = RunSupervisor::new(repo.path(), &config, fakes.collaborators());

    let plans = vec![plan("run-a"), plan("run-b"), plan("run-c")];
    let err = supervisor
        .execute_runs_in_parallel(&plans, Some(&grant(&["run-a", "run-b"])))
        .expect_err("partial grant");
    assert!(err.downcast_ref::<ParallelNotAuthorized>().is_some(), "{err:#}");
    assert_eq!(fakes.builder.calls(), 0);
}

#[test]
fn duplicate_run_ids_are_rejected() {
    let repo = TestRepo::new().expect("repo");
    let config = config(&repo);
    let fakes = Fakes::new();
    let supervisor = RunSupervisor::new(repo.path(), &config, fakes.collaborators());

    let plans = vec![plan("run-a"), plan("run-a")];
    let err = supervisor
        .execute_runs_in_parallel(&plans, Some(&grant(&["run-a"])))
        .expect_err("duplicate");
    assert!(err.to_string().contains("run-a"), "{err:#}");
    assert_eq!(fakes.tests.full_calls(), 0);
}

#[test]
fn authorized_runs_each_get_their_own_working_copy() {
    let repo = TestRepo::new().expect("repo");
    let config = config(&repo);
    let fakes = Fakes::new();
    let supervisor = RunSupervisor::new(repo.path(), &config, fakes.collaborators());

    let plans = vec![plan("run-a"), plan("run-b"), plan("run-c")];
    let results = supervisor
        .execute_runs_in_parallel(&plans, Some(&grant(&["run-a", "run-b", "run-c"])))
        .expect("authorized");
    assert_eq!(results.len(), 3);

    let mut copies = BTreeSet::new();
    for (plan, result) in plans.iter().zip(results) {
        let result = result.expect("run");
        assert_eq!(result.run_id, plan.run_id, "results come back in plan order");
        assert_eq!(result.status, RunStatus::Completed);
        assert!(result.all_complete());
        copies.insert(result.working_copy);
    }
    assert_eq!(copies.len(), 3);
    assert_eq!(fakes.tests.workdirs().len(), 3);
    assert_eq!(fakes.builder.calls(), 3);
    assert_eq!(fs::read_dir(&config.worktrees_dir).expect("dir").count(), 0);
}

#[test]
fn a_single_plan_needs_no_authorization() {
    let repo = TestRepo::new().expect("repo");
    let config = config(&repo);
    let fakes = Fakes::new();
    let supervisor = RunSupervisor::new(repo.path(), &config, fakes.collaborators());

    let results = supervisor
        .execute_runs_in_parallel(&[plan("run-solo")], None)
        .expect("single run");
    assert_eq!(results.len(), 1);
    assert!(results[0].as_ref().expect("run").all_complete());
}

#[test]
fn a_run_already_executing_elsewhere_is_contended() {
    let repo = TestRepo::new().expect("repo");
    let config = config(&repo);
    let fakes = Fakes::new();
    let supervisor = RunSupervisor::new(repo.path(), &config, fakes.collaborators());

    let held = ExecutorLock::acquire(
        &config.run_root,
        "run-a",
        config.lock_timeout(),
        config.poll_interval(),
    )
    .expect("first holder");
    let err = supervisor
        .execute_run(&plan("run-a"))
        .expect_err("second executor");
    let contended = err.downcast_ref::<LockContended>().expect("typed contention");
    assert_eq!(contended.key, "run-a");
    assert!(contended.holder.is_some(), "holder is reported");
    assert_eq!(fakes.builder.calls(), 0);
    assert_eq!(fakes.tests.full_calls(), 0);
    assert_eq!(
        fs::read_dir(&config.worktrees_dir).expect("dir").count(),
        0,
        "the working copy is released when the lock is refused"
    );

    held.release().expect("release");
    let result = supervisor.execute_run(&plan("run-a")).expect("after release");
    assert!(result.all_complete());
}

#[test]
fn abort_marker_from_another_process_stops_the_run() {
    let repo = TestRepo::new().expect("repo");
    let config = config(&repo);
    let fakes = Fakes::new();
    let supervisor = RunSupervisor::new(repo.path(), &config, fakes.collaborators());

    request_abort(&config.run_root, "run-x").expect("marker");
    let result = supervisor.execute_run(&plan("run-x")).expect("run");
    assert_eq!(result.status, RunStatus::Aborted);
    assert_eq!(fakes.builder.calls(), 0);
}
