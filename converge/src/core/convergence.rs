//! Convergence criteria and cycle planning.

use crate::core::metrics::TestCounts;

/// When a test run counts as converged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceCriteria {
    pub target_pass_rate: u32,
    /// Floor on `pass + fail`; guards against trivially empty suites.
    pub min_total_tests: u32,
}

impl ConvergenceCriteria {
    pub fn is_met(&self, counts: &TestCounts) -> bool {
        counts.pass_rate() >= self.target_pass_rate
            && counts.total() >= u64::from(self.min_total_tests)
    }
}

/// What `CycleStart` does with the persisted counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePlan {
    /// Run cycle number `cycle` (1-indexed).
    Run { cycle: u32 },
    /// The cycle budget is spent; run the final test and settle.
    Exhausted { cycles_run: u32 },
}

pub fn plan_cycle(counter: u32, max_cycles: u32) -> CyclePlan {
    if counter >= max_cycles {
        CyclePlan::Exhausted {
            cycles_run: counter,
        }
    } else {
        CyclePlan::Run {
            cycle: counter + 1,
        }
    }
}

/// One-line description of a cycle's test movement.
pub fn work_summary(cycle: u32, baseline: &TestCounts, post: &TestCounts) -> String {
    format!(
        "cycle {cycle}: pass rate {}% -> {}% ({} passed, {} failed)",
        baseline.pass_rate(),
        post.pass_rate(),
        post.pass,
        post.fail
    )
}
