//! Status record access for the owning controller.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::Utc;
use tracing::debug;

use crate::core::types::AgentStatus;
use crate::io::record_store::{WriteOutcome, read_json, status_schema, write_json};

/// Read-modify-write access to `status/<agent>.json`.
///
/// Clones share one in-process lock so the heartbeat thread and the main
/// state machine never interleave a read-modify-write.
#[derive(Debug, Clone)]
pub struct StatusStore {
    agent: String,
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl StatusStore {
    pub fn new(agent: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            agent: agent.into(),
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<AgentStatus>> {
        read_json(&self.path)
    }

    /// Apply `f` to the current record (or a fresh one) and persist it.
    ///
    /// Every update also refreshes the heartbeat.
    pub fn update<F>(&self, f: F) -> Result<AgentStatus>
    where
        F: FnOnce(&mut AgentStatus),
    {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("status lock poisoned"))?;
        let now = Utc::now();
        let mut status = self
            .load()?
            .unwrap_or_else(|| AgentStatus::new(&self.agent, now));
        f(&mut status);
        status.heartbeat = now;
        if write_json(&self.path, &status, Some(status_schema()))? == WriteOutcome::Discarded {
            debug!(agent = %self.agent, "status update discarded; previous record kept");
        }
        Ok(status)
    }

    /// Create the record if absent; otherwise leave it as is apart from the heartbeat.
    pub fn ensure(&self) -> Result<AgentStatus> {
        self.update(|_| {})
    }

    pub fn touch_heartbeat(&self) -> Result<()> {
        self.update(|_| {}).map(|_| ())
    }
}
