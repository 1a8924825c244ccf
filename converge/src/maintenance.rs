//! Terminal maintenance state: keep the heartbeat alive, do nothing else.

use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::io::status::StatusStore;

/// Refresh the heartbeat every `interval`.
///
/// With `ticks: None` this never returns; leaving maintenance takes a fresh
/// start and a new process. Heartbeat write failures are logged and retried on
/// the next tick.
pub fn run_maintenance(status: &StatusStore, interval: Duration, ticks: Option<u64>) {
    info!(interval_secs = interval.as_secs(), "entering maintenance");
    let mut done = 0u64;
    loop {
        if let Err(err) = status.touch_heartbeat() {
            warn!("maintenance heartbeat failed: {err:#}");
        }
        done += 1;
        if ticks.is_some_and(|limit| done >= limit) {
            return;
        }
        thread::sleep(interval);
    }
}
