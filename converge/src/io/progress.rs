//! Append-only progress narrative (`progress/<agent>.md`).
//!
//! Lines are only ever appended, so the history of a failed convergence
//! attempt stays inspectable after the fact.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

#[derive(Debug, Clone)]
pub struct ProgressLog {
    agent: String,
    path: PathBuf,
}

impl ProgressLog {
    pub fn new(agent: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            agent: agent.into(),
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, message: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create progress dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open progress log {}", self.path.display()))?;
        let is_new = file
            .metadata()
            .with_context(|| format!("stat progress log {}", self.path.display()))?
            .len()
            == 0;

        let mut buf = String::new();
        if is_new {
            buf.push_str(&format!("# Progress: {}\n\n", self.agent));
        }
        buf.push_str(&format!(
            "- {} {}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            message.trim()
        ));
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append progress log {}", self.path.display()))
    }
}
