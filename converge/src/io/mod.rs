//! Side-effecting adapters: shared-state records, dependency polling, and
//! child processes (test command and worker).

pub mod config;
pub mod context;
pub mod cycle_counter;
pub mod cycle_log;
pub mod heartbeat;
pub mod layout;
pub mod marker;
pub mod process;
pub mod progress;
pub mod record_store;
pub mod resolver;
pub mod signals;
pub mod status;
pub mod test_runner;
pub mod worker;
