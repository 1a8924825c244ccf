//! Record types shared between the controller and its dependents.
//!
//! These are the on-disk contracts: other agents and external monitors read
//! them, so field names are stable and serialized in snake_case.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::metrics::TestCounts;
use crate::core::scrape::Finding;

/// Keep status records small; older entries fall off the front.
const MAX_FILES_TRACKED: usize = 200;
const MAX_ERRORS_TRACKED: usize = 50;

/// Coarse lifecycle state published in the status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    Initializing,
    Working,
    Completed,
    Stopped,
}

/// Per-agent status record (`status/<agent>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent: String,
    pub status: LifecycleStatus,
    pub restart_cycle: u32,
    pub heartbeat: DateTime<Utc>,
    pub tests_pass: u32,
    pub tests_fail: u32,
    pub test_pass_rate: u32,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub work_summary: Option<String>,
    /// Why the agent last restarted or stopped early.
    #[serde(default)]
    pub reason: Option<String>,
}

impl AgentStatus {
    pub fn new(agent: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent: agent.into(),
            status: LifecycleStatus::Initializing,
            restart_cycle: 0,
            heartbeat: now,
            tests_pass: 0,
            tests_fail: 0,
            test_pass_rate: 0,
            files_modified: Vec::new(),
            errors: Vec::new(),
            work_summary: None,
            reason: None,
        }
    }

    pub fn record_counts(&mut self, counts: &TestCounts) {
        self.tests_pass = counts.pass;
        self.tests_fail = counts.fail;
        self.test_pass_rate = counts.pass_rate();
    }

    pub fn counts(&self) -> TestCounts {
        TestCounts::new(self.tests_pass, self.tests_fail)
    }

    /// Fold a transcript finding in. Returns `false` when nothing changed.
    pub fn apply_finding(&mut self, finding: &Finding) -> bool {
        match finding {
            Finding::FileModified(path) => {
                if self.files_modified.iter().any(|p| p == path) {
                    return false;
                }
                self.files_modified.push(path.clone());
                trim_front(&mut self.files_modified, MAX_FILES_TRACKED);
            }
            Finding::Error(msg) => {
                self.errors.push(msg.clone());
                trim_front(&mut self.errors, MAX_ERRORS_TRACKED);
            }
        }
        true
    }

    /// Clear per-cycle observations at the start of a new cycle.
    pub fn begin_cycle(&mut self, cycle: u32) {
        self.restart_cycle = cycle;
        self.files_modified.clear();
        self.errors.clear();
        self.reason = None;
    }
}

fn trim_front(items: &mut Vec<String>, max: usize) {
    if items.len() > max {
        let excess = items.len() - max;
        items.drain(..excess);
    }
}

/// Outcome carried by handoff (success) and blocker (failure) records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalOutcome {
    Success,
    Failure,
}

/// Handoff/blocker record (`handoffs/<agent>.json`, `blockers/<agent>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub agent: String,
    pub outcome: SignalOutcome,
    pub cycle: u32,
    pub tests_pass: u32,
    pub tests_fail: u32,
    pub test_pass_rate: u32,
    pub target_pass_rate: u32,
    pub summary: String,
    pub written_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn findings_dedupe_files_and_cap_errors() {
        let mut status = AgentStatus::new("api", Utc::now());
        assert!(status.apply_finding(&Finding::FileModified("a.rs".to_string())));
        assert!(!status.apply_finding(&Finding::FileModified("a.rs".to_string())));
        for i in 0..(MAX_ERRORS_TRACKED + 5) {
            status.apply_finding(&Finding::Error(format!("error: {i}")));
        }
        assert_eq!(status.files_modified, vec!["a.rs".to_string()]);
        assert_eq!(status.errors.len(), MAX_ERRORS_TRACKED);
        assert_eq!(status.errors[0], "error: 5");
    }

    #[test]
    fn status_serializes_lowercase_states() {
        let mut status = AgentStatus::new("api", Utc::now());
        status.status = LifecycleStatus::Completed;
        let value = serde_json::to_value(&status).expect("serialize");
        assert_eq!(value["status"], "completed");
        assert_eq!(value["restart_cycle"], 0);
    }

    #[test]
    fn begin_cycle_resets_observations() {
        let mut status = AgentStatus::new("api", Utc::now());
        status.apply_finding(&Finding::FileModified("a.rs".to_string()));
        status.reason = Some("dependency updated".to_string());
        status.begin_cycle(4);
        assert_eq!(status.restart_cycle, 4);
        assert!(status.files_modified.is_empty());
        assert!(status.reason.is_none());
    }
}
