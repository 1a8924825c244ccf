//! Dependency readiness and freshness against the shared state root.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::spec::{Dependency, DependencyKind};
use crate::io::config::{ArtifactPatterns, ControllerConfig};
use crate::io::layout::StateLayout;
use crate::io::record_store::read_optional;
use crate::io::signals::modified_at;

/// Status values a foreign writer may use to announce a finished process.
const FINISHED_STATUSES: [&str; 2] = ["completed", "success"];

/// Dependencies were still pending when the wait budget ran out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyTimeoutError {
    pub pending: Vec<String>,
    pub waited: Duration,
}

impl fmt::Display for DependencyTimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dependencies not ready after {}s: {}",
            self.waited.as_secs(),
            self.pending.join(", ")
        )
    }
}

impl std::error::Error for DependencyTimeoutError {}

/// Result of comparing dependency handoffs against the start marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Current,
    /// Dependencies whose handoff was rewritten after this lifetime started.
    Stale { updated: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct Resolver {
    layout: StateLayout,
    project_root: PathBuf,
    artifacts: BTreeMap<String, ArtifactPatterns>,
    poll_interval: Duration,
}

impl Resolver {
    pub fn new(
        layout: StateLayout,
        project_root: impl Into<PathBuf>,
        config: &ControllerConfig,
    ) -> Self {
        Self {
            layout,
            project_root: project_root.into(),
            artifacts: config.artifacts.clone(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Evaluate one dependency's readiness predicate.
    pub fn is_ready(&self, dep: &Dependency) -> Result<bool> {
        match &dep.kind {
            DependencyKind::TestArtifact { base } => {
                let pattern = self.test_glob(base);
                Ok(!self.matching_files(&pattern)?.is_empty())
            }
            DependencyKind::ImplArtifact { base } => {
                let pattern = self.impl_glob(base);
                let found = self
                    .matching_files(&pattern)?
                    .into_iter()
                    .any(|path| !is_test_path(&self.project_root, &path));
                Ok(found)
            }
            DependencyKind::ProcessOutcome => {
                if self.layout.handoff_path(&dep.name).exists() {
                    return Ok(true);
                }
                self.status_reports_finished(&dep.name)
            }
            DependencyKind::Generic => Ok(self.layout.handoff_path(&dep.name).exists()),
        }
    }

    /// Names of the dependencies that are not ready right now.
    pub fn pending(&self, deps: &[Dependency]) -> Result<Vec<String>> {
        let mut pending = Vec::new();
        for dep in deps {
            if !self.is_ready(dep)? {
                pending.push(dep.name.clone());
            }
        }
        Ok(pending)
    }

    /// Poll until every dependency is ready in the same pass, or fail with
    /// [`DependencyTimeoutError`] once `timeout` has elapsed.
    #[instrument(skip_all, fields(deps = deps.len(), timeout_secs = timeout.as_secs()))]
    pub fn wait_for_readiness(&self, deps: &[Dependency], timeout: Duration) -> Result<()> {
        let started = Instant::now();
        loop {
            let pending = self.pending(deps)?;
            if pending.is_empty() {
                debug!(waited_ms = started.elapsed().as_millis() as u64, "dependencies ready");
                return Ok(());
            }
            let waited = started.elapsed();
            if waited >= timeout {
                warn!(pending = ?pending, "dependency wait timed out");
                return Err(DependencyTimeoutError { pending, waited }.into());
            }
            info!(pending = ?pending, "waiting for dependencies");
            thread::sleep(self.poll_interval.min(timeout - waited));
        }
    }

    /// Compare every dependency's handoff mtime against `anchor`.
    pub fn check_freshness(&self, deps: &[Dependency], anchor: SystemTime) -> Result<Freshness> {
        let mut updated = Vec::new();
        for dep in deps {
            let handoff = self.layout.handoff_path(&dep.name);
            if let Some(modified) = modified_at(&handoff)?
                && modified > anchor
            {
                updated.push(dep.name.clone());
            }
        }
        if updated.is_empty() {
            Ok(Freshness::Current)
        } else {
            Ok(Freshness::Stale { updated })
        }
    }

    fn test_glob(&self, base: &str) -> String {
        self.artifacts
            .get(base)
            .and_then(|p| p.tests.clone())
            .unwrap_or_else(|| format!("tests/**/*{base}*"))
    }

    fn impl_glob(&self, base: &str) -> String {
        self.artifacts
            .get(base)
            .and_then(|p| p.implementation.clone())
            .unwrap_or_else(|| format!("src/**/*{base}*"))
    }

    fn matching_files(&self, relative: &str) -> Result<Vec<PathBuf>> {
        let root = glob::Pattern::escape(&self.project_root.to_string_lossy());
        let pattern = format!("{}/{}", root.trim_end_matches('/'), relative);
        let entries = glob::glob(&pattern).with_context(|| format!("invalid glob {pattern}"))?;
        Ok(entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(err) => {
                    debug!(err = %err, "skipping unreadable glob entry");
                    None
                }
            })
            .filter(|path| path.is_file())
            .collect())
    }

    fn status_reports_finished(&self, agent: &str) -> Result<bool> {
        let path = self.layout.status_path(agent);
        let Some(contents) = read_optional(&path)? else {
            return Ok(false);
        };
        // Read as raw JSON: the record may come from a writer with its own status vocabulary.
        let value: Value = match serde_json::from_str(&contents) {
            Ok(value) => value,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "unreadable dependency status");
                return Ok(false);
            }
        };
        Ok(value
            .get("status")
            .and_then(Value::as_str)
            .is_some_and(|status| FINISHED_STATUSES.contains(&status)))
    }
}

const TEST_DIRS: [&str; 4] = ["test", "tests", "__tests__", "spec"];

/// A test file lives under a test directory or carries a test-style file name.
fn is_test_path(root: &Path, path: &Path) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_ascii_lowercase())
        .collect();
    let Some((file_name, dirs)) = components.split_last() else {
        return false;
    };
    if dirs.iter().any(|dir| TEST_DIRS.contains(&dir.as_str())) {
        return true;
    }
    let stem = file_name.split('.').next().unwrap_or(file_name);
    stem.starts_with("test_")
        || stem.ends_with("_test")
        || file_name.contains(".test.")
        || file_name.contains(".spec.")
}
