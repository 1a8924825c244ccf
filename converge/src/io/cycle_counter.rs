//! Persisted per-agent cycle counter (`agents/<agent>/restart_count`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::io::record_store::{WriteOutcome, read_optional, write_validated};

/// Single non-negative integer that survives process restarts.
///
/// Only the owning controller mutates it; fresh start is the only reset.
#[derive(Debug, Clone)]
pub struct CycleCounter {
    path: PathBuf,
}

impl CycleCounter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current value; an absent record reads as 0.
    pub fn load(&self) -> Result<u32> {
        let Some(contents) = read_optional(&self.path)? else {
            return Ok(0);
        };
        contents
            .trim()
            .parse()
            .with_context(|| format!("parse cycle counter {}", self.path.display()))
    }

    pub fn store(&self, value: u32) -> Result<()> {
        let outcome = write_validated(&self.path, &format!("{value}\n"), |landed| {
            landed
                .trim()
                .parse::<u32>()
                .map(|_| ())
                .context("cycle counter candidate is not an integer")
        })?;
        if outcome == WriteOutcome::Discarded {
            warn!(path = %self.path.display(), value, "cycle counter write discarded");
        } else {
            debug!(value, "cycle counter stored");
        }
        Ok(())
    }

    pub fn reset(&self) -> Result<()> {
        self.store(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_counter_is_zero() {
        let temp = tempfile::tempdir().expect("tempdir");
        let counter = CycleCounter::new(temp.path().join("agents/api/restart_count"));
        assert_eq!(counter.load().expect("load"), 0);
    }

    #[test]
    fn store_survives_new_handle() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agents/api/restart_count");
        CycleCounter::new(&path).store(4).expect("store");
        assert_eq!(CycleCounter::new(&path).load().expect("load"), 4);

        CycleCounter::new(&path).reset().expect("reset");
        assert_eq!(CycleCounter::new(&path).load().expect("load"), 0);
    }

    #[test]
    fn corrupt_counter_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("restart_count");
        std::fs::write(&path, "lots").expect("write");
        let err = CycleCounter::new(&path).load().unwrap_err();
        assert!(err.to_string().contains("parse cycle counter"));
    }
}
