//! In-process cycle loop for `converge loop`.

use anyhow::Result;
use tracing::info;

use crate::cycle::{Agent, CycleOutcome, Settlement, run_cycle};
use crate::io::test_runner::TestRunner;
use crate::io::worker::Worker;

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    /// Cycles that ran the worker to completion.
    pub cycles_completed: u32,
    /// Cycles abandoned because a dependency changed.
    pub restarts: u32,
    pub settlement: Settlement,
}

/// Run cycles back to back until the agent settles.
///
/// Writes the same records at the same checkpoints as restart-driven mode; a
/// stale cycle just moves on to the next one. Stops immediately on any error.
pub fn run_loop<T: TestRunner, W: Worker, F: FnMut(&CycleOutcome)>(
    agent: &Agent,
    tests: &T,
    worker: &W,
    mut on_cycle: F,
) -> Result<LoopOutcome> {
    let mut cycles_completed = 0u32;
    let mut restarts = 0u32;
    loop {
        let outcome = run_cycle(agent, tests, worker)?;
        on_cycle(&outcome);
        match outcome {
            CycleOutcome::Settled(settlement) => {
                info!(cycles_completed, restarts, outcome = ?settlement.outcome, "loop settled");
                return Ok(LoopOutcome {
                    cycles_completed,
                    restarts,
                    settlement,
                });
            }
            CycleOutcome::Completed { .. } => cycles_completed += 1,
            CycleOutcome::Restart { .. } => restarts += 1,
        }
    }
}
