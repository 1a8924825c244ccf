//! Fresh start: the only way to move an agent's counter backwards.

use anyhow::Result;
use tracing::info;

use crate::core::types::LifecycleStatus;
use crate::cycle::AgentRecords;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    pub previous_counter: u32,
    pub marker_removed: bool,
}

/// Zero the counter, drop the start marker and mark the status as initializing.
///
/// Handoff and blocker records are left alone; the next settlement replaces
/// whichever one is present. Running it twice is the same as running it once.
pub fn fresh_start(records: &AgentRecords) -> Result<ResetOutcome> {
    let previous_counter = records.counter.load()?;
    records.counter.reset()?;
    let marker_removed = records.marker.clear()?;
    records.status.update(|s| {
        s.status = LifecycleStatus::Initializing;
        s.restart_cycle = 0;
        s.reason = None;
    })?;
    records
        .progress
        .append(&format!("fresh start (counter was {previous_counter})"))?;
    info!(previous_counter, marker_removed, "fresh start");
    Ok(ResetOutcome {
        previous_counter,
        marker_removed,
    })
}
