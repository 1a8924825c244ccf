//! Stable exit codes for the `converge` binary.

/// Cycle finished or restart expected; the hosting runtime starts the next process.
pub const OK: i32 = 0;
/// Invalid configuration, dependency timeout, or any other fatal error.
pub const INVALID: i32 = 1;
/// Stopped by SIGINT/SIGTERM.
pub const TERMINATED: i32 = 130;
