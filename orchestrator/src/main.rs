//! Phase orchestrator CLI.
//!
//! Reads `.orchestrator/config.toml` from the repository root and writes
//! run artifacts under the configured run root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use orchestrator::baseline::BaselineTracker;
use orchestrator::core::authorization::ParallelAuthorization;
use orchestrator::error::LockContended;
use orchestrator::exit_codes;
use orchestrator::governance;
use orchestrator::io::agents::{CommandAuditor, CommandBuilder};
use orchestrator::io::approval::LedgerApprovalChannel;
use orchestrator::io::artifacts::{RunArtifacts, read_json};
use orchestrator::io::config::{
    CONFIG_RELATIVE_PATH, OrchestratorConfig, load_config, write_config,
};
use orchestrator::io::git::Git;
use orchestrator::io::ledger::GovernanceLedger;
use orchestrator::io::report::load_report;
use orchestrator::io::test_runner::CommandTestRunner;
use orchestrator::logging;
use orchestrator::supervisor::{
    Collaborators, RunPlan, RunResult, RunSupervisor, authorize_parallel, load_plan, request_abort,
};
use orchestrator::workers::{WorkerSpec, spawn_workers, wait_workers, worker_command};

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Phase orchestrator with regression, governance and isolation gates"
)]
struct Cli {
    /// Repository to operate on (any directory inside it).
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default `.orchestrator/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Capture or compare test baselines.
    #[command(subcommand)]
    Baseline(BaselineCommand),
    /// Inspect and decide governance requests.
    #[command(subcommand)]
    Governance(GovernanceCommand),
    /// Execute one or more run plans.
    Run(RunArgs),
    /// Ask a run to stop before its next phase.
    Abort {
        run_id: String,
    },
}

#[derive(Subcommand)]
enum BaselineCommand {
    /// Capture (or load the cached) baseline at the workspace HEAD.
    Capture {
        #[arg(long)]
        run_id: String,
        /// Working copy to test; defaults to the repository root.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },
    /// Diff a structured report against a cached baseline, without retry.
    Diff {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        commit: String,
        #[arg(long)]
        report: PathBuf,
    },
}

#[derive(Subcommand)]
enum GovernanceCommand {
    /// List requests awaiting a decision.
    List,
    /// Print one request as JSON.
    Show { request_id: String },
    Approve {
        request_id: String,
        #[arg(long)]
        by: String,
    },
    Deny {
        request_id: String,
        #[arg(long)]
        by: String,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Run plan (TOML); repeat for several runs.
    #[arg(long = "plan", required = true)]
    plans: Vec<PathBuf>,
    /// Parallel authorization artifact (JSON); required for more than one plan.
    #[arg(long)]
    authorization: Option<PathBuf>,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if err.downcast_ref::<LockContended>().is_some() {
        exit_codes::CONTENTION
    } else {
        exit_codes::INVALID
    }
}

fn run(cli: Cli) -> Result<i32> {
    let repo_root = Git::new(&cli.repo).toplevel()?;
    match cli.command {
        Command::Init { force } => cmd_init(&repo_root, force),
        Command::Baseline(command) => cmd_baseline(&repo_root, command),
        Command::Governance(command) => cmd_governance(&repo_root, command),
        Command::Run(args) => cmd_run(&repo_root, &args),
        Command::Abort { run_id } => {
            let config = load_repo_config(&repo_root)?;
            let marker = request_abort(&config.run_root_in(&repo_root), &run_id)?;
            println!("{}", marker.display());
            Ok(exit_codes::OK)
        }
    }
}

fn load_repo_config(repo_root: &Path) -> Result<OrchestratorConfig> {
    load_config(&repo_root.join(CONFIG_RELATIVE_PATH))
}

fn cmd_init(repo_root: &Path, force: bool) -> Result<i32> {
    let path = repo_root.join(CONFIG_RELATIVE_PATH);
    if path.exists() && !force {
        println!("{} already exists (use --force to overwrite)", path.display());
        return Ok(exit_codes::OK);
    }
    write_config(&path, &OrchestratorConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_baseline(repo_root: &Path, command: BaselineCommand) -> Result<i32> {
    let config = load_repo_config(repo_root)?;
    let run_root = config.run_root_in(repo_root);
    let runner = CommandTestRunner::new(config.tests.command.clone())?;
    match command {
        BaselineCommand::Capture { run_id, workspace } => {
            let workspace = workspace.unwrap_or_else(|| repo_root.to_path_buf());
            let commit = Git::new(&workspace).head_commit()?;
            let artifacts = RunArtifacts::new(&run_root, &run_id)?;
            artifacts.ensure_layout()?;
            let tracker = BaselineTracker::new(&runner, &artifacts, &config);
            let baseline = tracker.capture(&workspace, &commit)?;
            println!("{}", artifacts.baseline_path(&baseline.commit_id)?.display());
        }
        BaselineCommand::Diff {
            run_id,
            commit,
            report,
        } => {
            let artifacts = RunArtifacts::new(&run_root, &run_id)?;
            let tracker = BaselineTracker::new(&runner, &artifacts, &config);
            let baseline = tracker
                .load(&commit)?
                .with_context(|| format!("no baseline for commit {commit} in run {run_id}"))?;
            let delta = tracker.diff(&baseline, &load_report(&report)?);
            println!(
                "{}",
                serde_json::to_string_pretty(&delta).context("serialize delta")?
            );
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_governance(repo_root: &Path, command: GovernanceCommand) -> Result<i32> {
    let config = load_repo_config(repo_root)?;
    let run_root = config.run_root_in(repo_root);
    match command {
        GovernanceCommand::List => {
            for request in governance::list_pending(&run_root)? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    request.request_id,
                    request.run_id,
                    request.phase_id,
                    request.risk_level,
                    request.requested_paths.join(",")
                );
            }
        }
        GovernanceCommand::Show { request_id } => {
            let request = governance::show(&run_root, &request_id)?
                .with_context(|| format!("unknown governance request {request_id}"))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&request).context("serialize request")?
            );
        }
        GovernanceCommand::Approve { request_id, by } => {
            let request = governance::approve(&run_root, &request_id, &by)?;
            println!("{} approved by {by}", request.request_id);
        }
        GovernanceCommand::Deny { request_id, by } => {
            let request = governance::deny(&run_root, &request_id, &by)?;
            println!("{} denied by {by}", request.request_id);
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_run(repo_root: &Path, args: &RunArgs) -> Result<i32> {
    let config = load_repo_config(repo_root)?;
    let plans = args
        .plans
        .iter()
        .map(|path| load_plan(path))
        .collect::<Result<Vec<_>>>()?;
    let authorization: Option<ParallelAuthorization> = match &args.authorization {
        Some(path) => Some(
            read_json(path)?
                .with_context(|| format!("authorization {} not found", path.display()))?,
        ),
        None => None,
    };
    authorize_parallel(&plans, authorization.as_ref())?;

    if plans.len() > 1 {
        return run_in_workers(repo_root, args, &plans);
    }

    let builder = CommandBuilder::new(config.builder.clone())?;
    let auditor = CommandAuditor::new(config.auditor.clone())?;
    let tests = CommandTestRunner::new(config.tests.command.clone())?;
    let approvals = LedgerApprovalChannel::new(
        GovernanceLedger::new(&config.run_root_in(repo_root)),
        config.governance.approval_timeout(),
        config.governance.approval_poll_interval(),
    );
    let supervisor = RunSupervisor::new(
        repo_root,
        &config,
        Collaborators {
            builder: &builder,
            auditor: &auditor,
            tests: &tests,
            approvals: &approvals,
        },
    );

    let mut code = exit_codes::OK;
    for plan in &plans {
        match supervisor.execute_run(plan) {
            Ok(result) => {
                print_result(&result);
                if !result.all_complete() {
                    code = code.max(exit_codes::BLOCKED);
                }
            }
            Err(err) => {
                println!("{}: error: {err:#}", plan.run_id);
                code = code.max(exit_code_for(&err));
            }
        }
    }
    Ok(code)
}

/// One worker process per authorized plan; each reports its own run.
fn run_in_workers(repo_root: &Path, args: &RunArgs, plans: &[RunPlan]) -> Result<i32> {
    let program = std::env::current_exe().context("locate the orchestrator executable")?;
    let specs = plans
        .iter()
        .zip(&args.plans)
        .map(|(plan, path)| {
            Ok(WorkerSpec {
                run_id: plan.run_id.clone(),
                plan_path: path
                    .canonicalize()
                    .with_context(|| format!("resolve plan {}", path.display()))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let workers = spawn_workers(&specs, |spec| {
        worker_command(&program, repo_root, &spec.plan_path)
    })?;
    let mut code = exit_codes::OK;
    for exit in wait_workers(workers)? {
        println!("{}: worker {} exited with {}", exit.run_id, exit.pid, exit.exit_code());
        code = code.max(exit.exit_code());
    }
    Ok(code)
}

fn print_result(result: &RunResult) {
    println!(
        "{}: {:?} ({})",
        result.run_id,
        result.status,
        result.working_copy.display()
    );
    if let (Some(name), Some(head)) = (&result.result_ref, &result.head_commit) {
        println!("  {name} -> {head}");
    }
    for decision in &result.decisions {
        println!("  {} {}: {}", decision.phase_id, decision.status, decision.reason);
    }
    if let Some(error) = &result.error {
        println!("  error: {error}");
    }
}
