//! Per-cycle logging under `agents/<agent>/cycles/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a cycle ended, as recorded in `meta.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleEnd {
    /// Baseline met the target; the worker was not invoked.
    Converged,
    /// Worker and post-test ran; the next cycle re-evaluates.
    Completed,
    /// A dependency changed underneath the cycle.
    Restarted,
    /// Cycle budget spent below target.
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleMeta {
    pub agent: String,
    pub cycle: u32,
    pub started_at: DateTime<Utc>,
    pub baseline_rate: Option<u32>,
    pub post_rate: Option<u32>,
    pub outcome: CycleEnd,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct CyclePaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub context_path: PathBuf,
    pub baseline_log_path: PathBuf,
    pub worker_log_path: PathBuf,
    pub post_log_path: PathBuf,
}

impl CyclePaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            meta_path: dir.join("meta.json"),
            context_path: dir.join("context.md"),
            baseline_log_path: dir.join("baseline.log"),
            worker_log_path: dir.join("worker.log"),
            post_log_path: dir.join("post.log"),
            dir,
        }
    }

    /// Create the directory, clearing logs left by an interrupted attempt at the same cycle.
    pub fn prepare(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("clear cycle dir {}", self.dir.display()))?;
        }
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create cycle dir {}", self.dir.display()))
    }

    pub fn write_context(&self, bundle: &str) -> Result<()> {
        write_text(&self.context_path, bundle)
    }

    pub fn write_meta(&self, meta: &CycleMeta) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(meta).context("serialize cycle meta")?;
        buf.push('\n');
        write_text(&self.meta_path, &buf)
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_paths_are_stable() {
        let paths = CyclePaths::new("/state/agents/api/cycles/3");
        assert!(paths.meta_path.ends_with("cycles/3/meta.json"));
        assert!(paths.context_path.ends_with("context.md"));
        assert!(paths.baseline_log_path.ends_with("baseline.log"));
        assert!(paths.worker_log_path.ends_with("worker.log"));
        assert!(paths.post_log_path.ends_with("post.log"));
    }

    #[test]
    fn prepare_clears_stale_logs_and_meta_is_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = CyclePaths::new(temp.path().join("cycles/1"));
        fs::create_dir_all(&paths.dir).expect("mkdir");
        fs::write(&paths.worker_log_path, "half a transcript").expect("write");

        paths.prepare().expect("prepare");
        assert!(!paths.worker_log_path.exists());

        let meta = CycleMeta {
            agent: "api".to_string(),
            cycle: 1,
            started_at: Utc::now(),
            baseline_rate: Some(40),
            post_rate: Some(55),
            outcome: CycleEnd::Completed,
            duration_ms: 12,
        };
        paths.write_meta(&meta).expect("meta");
        let loaded: CycleMeta =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("read"))
                .expect("parse");
        assert_eq!(loaded, meta);
        assert!(
            fs::read_to_string(&paths.meta_path)
                .expect("read")
                .contains("\"completed\"")
        );
    }
}
