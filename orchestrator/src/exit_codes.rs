//! Stable exit codes for orchestrator CLI commands.

/// Command succeeded; every phase of every run completed.
pub const OK: i32 = 0;
/// Invalid config, plan or arguments, or an environment failure.
pub const INVALID: i32 = 1;
/// A phase was blocked, failed, or a run was aborted.
pub const BLOCKED: i32 = 2;
/// A workspace lease or execution lock is held by someone else.
pub const CONTENTION: i32 = 3;
