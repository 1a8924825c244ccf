//! Freshness anchor (`agents/<agent>/start_marker`).
//!
//! Stamped once per process lifetime, right after dependencies are ready.
//! Its modification time is the reference every freshness checkpoint in that
//! lifetime compares dependency handoffs against.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::debug;

use crate::io::record_store::{read_optional, remove_if_exists, write_validated};

#[derive(Debug, Clone)]
pub struct StartMarker {
    path: PathBuf,
}

impl StartMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the marker and return its on-disk modification time.
    pub fn stamp(&self) -> Result<SystemTime> {
        let contents = format!("{}\n", Utc::now().to_rfc3339());
        write_validated(&self.path, &contents, |_| Ok(()))?;
        let stamped = self
            .stamped_at()?
            .with_context(|| format!("start marker vanished {}", self.path.display()))?;
        debug!(path = %self.path.display(), "start marker stamped");
        Ok(stamped)
    }

    /// Modification time of the marker, if present.
    pub fn stamped_at(&self) -> Result<Option<SystemTime>> {
        if read_optional(&self.path)?.is_none() {
            return Ok(None);
        }
        let modified = fs::metadata(&self.path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("stat start marker {}", self.path.display()))?;
        Ok(Some(modified))
    }

    pub fn clear(&self) -> Result<bool> {
        remove_if_exists(&self.path)
    }
}
