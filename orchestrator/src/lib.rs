//! Phase orchestration with regression, governance and isolation guarantees.
//!
//! A run is an ordered list of phases executed in its own working copy. The
//! crate is split the same way throughout:
//!
//! - **[`core`]**: pure, deterministic logic (scope matching, test deltas,
//!   severity, approval policy, completion gates). No I/O.
//! - **[`io`]**: side effects (git, child processes, the structured test
//!   runner, artifacts, locks, the governance ledger, external agents).
//!
//! Orchestration modules ([`baseline`], [`governance`], [`finalize`],
//! [`phase`], [`supervisor`], [`workers`]) coordinate core logic with I/O
//! and back the CLI.

pub mod baseline;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod finalize;
pub mod governance;
pub mod io;
pub mod logging;
pub mod phase;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod workers;
