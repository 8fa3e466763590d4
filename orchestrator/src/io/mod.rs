//! Side-effecting adapters: processes, git, files, locks.

pub mod agents;
pub mod approval;
pub mod artifacts;
pub mod config;
pub mod exec_lock;
pub mod git;
pub mod lease;
pub mod ledger;
pub mod lockfile;
pub mod process;
pub mod report;
pub mod run_state;
pub mod test_runner;
pub mod worktree;
