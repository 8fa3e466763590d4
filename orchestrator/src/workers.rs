//! One OS process per run.
//!
//! A multi-plan `orchestrator run` checks the parallel authorization once,
//! then starts a worker process per plan. Each worker executes exactly one
//! run with its own working copy, lease and execution lock, so a hung or
//! crashing collaborator only takes its own run down.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::exit_codes;

/// A plan to hand to a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub run_id: String,
    pub plan_path: PathBuf,
}

#[derive(Debug)]
pub struct RunWorker {
    run_id: String,
    child: Child,
}

impl RunWorker {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub run_id: String,
    pub pid: u32,
    /// `None` when the worker was killed by a signal.
    pub code: Option<i32>,
}

impl WorkerExit {
    /// The worker's exit code; a worker that died without one counts as an
    /// environment failure.
    pub fn exit_code(&self) -> i32 {
        self.code.unwrap_or(exit_codes::INVALID)
    }
}

/// Command line a worker runs for one plan: `orchestrator --repo <root> run --plan <plan>`.
pub fn worker_command(program: &Path, repo_root: &Path, plan_path: &Path) -> Command {
    let mut cmd = Command::new(program);
    cmd.arg("--repo")
        .arg(repo_root)
        .arg("run")
        .arg("--plan")
        .arg(plan_path);
    cmd
}

/// Start one worker per [`WorkerSpec`], in order.
///
/// If any worker fails to start, those already running are killed and
/// reaped before the error is returned.
pub fn spawn_workers<F>(specs: &[WorkerSpec], mut command_for: F) -> Result<Vec<RunWorker>>
where
    F: FnMut(&WorkerSpec) -> Command,
{
    let mut workers: Vec<RunWorker> = Vec::with_capacity(specs.len());
    for spec in specs {
        let spawned = command_for(spec)
            .spawn()
            .with_context(|| format!("start worker for run {}", spec.run_id));
        match spawned {
            Ok(child) => {
                info!(run_id = %spec.run_id, pid = child.id(), "run worker started");
                workers.push(RunWorker {
                    run_id: spec.run_id.clone(),
                    child,
                });
            }
            Err(err) => {
                error!(run_id = %spec.run_id, err = %err, "worker failed to start, stopping the others");
                for mut started in workers {
                    if let Err(kill_err) = started.child.kill() {
                        warn!(run_id = %started.run_id, err = %kill_err, "could not kill worker");
                    }
                    if let Err(wait_err) = started.child.wait() {
                        warn!(run_id = %started.run_id, err = %wait_err, "could not reap worker");
                    }
                }
                return Err(err);
            }
        }
    }
    Ok(workers)
}

/// Wait for every worker; results are in spawn order.
pub fn wait_workers(workers: Vec<RunWorker>) -> Result<Vec<WorkerExit>> {
    let mut exits = Vec::with_capacity(workers.len());
    for mut worker in workers {
        let pid = worker.pid();
        let status = worker
            .child
            .wait()
            .with_context(|| format!("wait for worker of run {}", worker.run_id))?;
        let exit = WorkerExit {
            run_id: worker.run_id,
            pid,
            code: status.code(),
        };
        match exit.code {
            Some(exit_codes::OK) => info!(run_id = %exit.run_id, pid, "run worker finished"),
            Some(code) => warn!(run_id = %exit.run_id, pid, code, "run worker finished unsuccessfully"),
            None => error!(run_id = %exit.run_id, pid, "run worker killed by a signal"),
        }
        exits.push(exit);
    }
    Ok(exits)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(run_id: &str) -> WorkerSpec {
        WorkerSpec {
            run_id: run_id.to_string(),
            plan_path: PathBuf::from(format!("{run_id}.toml")),
        }
    }

    fn exiting_with(code: i32) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", &format!("exit {code}")]);
        cmd
    }

    #[test]
    fn each_run_gets_its_own_process_and_exit_code() {
        let specs = [spec("run-a"), spec("run-b")];
        let workers = spawn_workers(&specs, |s| {
            exiting_with(if s.run_id == "run-a" { 0 } else { 2 })
        })
        .expect("spawn");
        assert_ne!(workers[0].pid(), workers[1].pid());
        assert_ne!(workers[0].pid(), std::process::id());
        assert_eq!(workers[1].run_id(), "run-b");

        let exits = wait_workers(workers).expect("wait");
        assert_eq!(exits[0].exit_code(), exit_codes::OK);
        assert_eq!(exits[1].exit_code(), exit_codes::BLOCKED);
        assert_eq!(exits[1].run_id, "run-b");
    }

    #[test]
    fn failed_start_stops_the_workers_already_running() {
        let specs = [spec("run-a"), spec("run-b")];
        let err = spawn_workers(&specs, |s| {
            if s.run_id == "run-a" {
                let mut cmd = Command::new("sleep");
                cmd.arg("30");
                cmd
            } else {
                Command::new("/nonexistent/orchestrator-worker")
            }
        })
        .expect_err("second worker cannot start");
        assert!(format!("{err:#}").contains("run-b"));
    }

    #[test]
    fn worker_command_runs_a_single_plan() {
        let cmd = worker_command(
            Path::new("/bin/orchestrator"),
            Path::new("/repo"),
            Path::new("/plans/a.toml"),
        );
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["--repo", "/repo", "run", "--plan", "/plans/a.toml"]);
    }
}
