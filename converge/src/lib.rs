//! Per-agent convergence controller.
//!
//! One controller process runs per agent. Controllers coordinate only through
//! records on a shared state root: each waits for its declared dependencies,
//! drives an external worker toward a test pass-rate target one cycle at a
//! time, and publishes a handoff (success) or blocker (failure) record for
//! downstream agents and operators. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (classification, metrics,
//!   convergence rules, record types). No I/O.
//! - **[`io`]**: Side-effecting operations (atomic records, dependency
//!   polling, test and worker processes). Behind traits where tests need fakes.
//!
//! Orchestration modules ([`cycle`], [`looping`], [`maintenance`], [`reset`])
//! combine the two to implement the CLI commands.

pub mod core;
pub mod cycle;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod maintenance;
pub mod reset;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
