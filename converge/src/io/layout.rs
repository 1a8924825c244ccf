//! Canonical paths within the shared state root.

use std::path::PathBuf;

/// Default state root, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".converge";

/// Shared state root holding every agent's records.
#[derive(Debug, Clone)]
pub struct StateLayout {
    pub root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join("converge.toml")
    }

    pub fn status_path(&self, agent: &str) -> PathBuf {
        self.root.join("status").join(format!("{agent}.json"))
    }

    pub fn progress_path(&self, agent: &str) -> PathBuf {
        self.root.join("progress").join(format!("{agent}.md"))
    }

    pub fn handoff_path(&self, agent: &str) -> PathBuf {
        self.root.join("handoffs").join(format!("{agent}.json"))
    }

    pub fn blocker_path(&self, agent: &str) -> PathBuf {
        self.root.join("blockers").join(format!("{agent}.json"))
    }

    pub fn feedback_path(&self, agent: &str) -> PathBuf {
        self.root.join("feedback").join(format!("{agent}.md"))
    }

    pub fn agent_dir(&self, agent: &str) -> PathBuf {
        self.root.join("agents").join(agent)
    }

    pub fn agent(&self, agent: &str) -> AgentPaths {
        AgentPaths::new(self, agent)
    }
}

/// All record paths owned by one agent.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    pub agent: String,
    pub status_path: PathBuf,
    pub progress_path: PathBuf,
    pub handoff_path: PathBuf,
    pub blocker_path: PathBuf,
    pub feedback_path: PathBuf,
    pub counter_path: PathBuf,
    pub marker_path: PathBuf,
    pub cycles_dir: PathBuf,
}

impl AgentPaths {
    pub fn new(layout: &StateLayout, agent: &str) -> Self {
        let agent_dir = layout.agent_dir(agent);
        Self {
            agent: agent.to_string(),
            status_path: layout.status_path(agent),
            progress_path: layout.progress_path(agent),
            handoff_path: layout.handoff_path(agent),
            blocker_path: layout.blocker_path(agent),
            feedback_path: layout.feedback_path(agent),
            counter_path: agent_dir.join("restart_count"),
            marker_path: agent_dir.join("start_marker"),
            cycles_dir: agent_dir.join("cycles"),
        }
    }

    pub fn cycle_dir(&self, cycle: u32) -> PathBuf {
        self.cycles_dir.join(cycle.to_string())
    }

    pub fn final_run_dir(&self) -> PathBuf {
        self.cycles_dir.join("final")
    }
}
