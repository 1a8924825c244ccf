//! Controller configuration stored under `<state-dir>/converge.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Controller configuration (TOML).
///
/// Shared by every agent on the same state root and edited by humans. Missing
/// fields fall back to defaults that suit a long-running deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ControllerConfig {
    pub dependencies: DependencyConfig,
    pub freshness: FreshnessConfig,
    pub heartbeat: HeartbeatConfig,
    pub tests: TestConfig,
    pub worker: WorkerConfig,
    pub workspace: WorkspaceConfig,
    /// Per-base glob overrides keyed by the dependency's base name.
    pub artifacts: BTreeMap<String, ArtifactPatterns>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DependencyConfig {
    pub poll_interval_secs: u64,
    /// Give up waiting for dependencies after this long.
    pub timeout_secs: u64,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            timeout_secs: 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FreshnessConfig {
    /// Elapsed worker time (seconds) at which dependency freshness is re-checked.
    pub worker_checkpoints_secs: Vec<u64>,
}

impl Default for FreshnessConfig {
    fn default() -> Self {
        Self {
            worker_checkpoints_secs: vec![10 * 60, 30 * 60],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Heartbeat period while a cycle is running.
    pub interval_secs: u64,
    /// Sleep between heartbeats once in maintenance.
    pub maintenance_interval_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            maintenance_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TestConfig {
    /// Kill the test command after this long. Unset means no limit.
    pub timeout_secs: Option<u64>,
    pub output_limit_bytes: usize,
    /// Trailing output lines folded into the worker context.
    pub context_lines: usize,
    /// Extra pass-count regexes (one capture group), tried before the built-ins.
    pub pass_patterns: Vec<String>,
    /// Extra fail-count regexes (one capture group), tried before the built-ins.
    pub fail_patterns: Vec<String>,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: None,
            output_limit_bytes: 1_000_000,
            context_lines: 80,
            pass_patterns: Vec::new(),
            fail_patterns: Vec::new(),
        }
    }
}

impl TestConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker command (e.g. `["codex","exec","-"]`); the context bundle arrives on stdin.
    pub command: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub output_limit_bytes: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "codex".to_string(),
                "exec".to_string(),
                "--skip-git-repo-check".to_string(),
                "-".to_string(),
            ],
            timeout_secs: None,
            output_limit_bytes: 1_000_000,
        }
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Directory the test command and artifact globs run against.
    pub project_root: PathBuf,
    /// When set, workers run in `<workspaces_dir>/<workspace key>` instead of the project root.
    pub workspaces_dir: Option<PathBuf>,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            project_root: PathBuf::from("."),
            workspaces_dir: None,
        }
    }
}

/// Glob overrides for one artifact base; relative to the project root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ArtifactPatterns {
    pub tests: Option<String>,
    #[serde(rename = "impl")]
    pub implementation: Option<String>,
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dependencies.poll_interval_secs == 0 {
            return Err(anyhow!("dependencies.poll_interval_secs must be > 0"));
        }
        if self.dependencies.timeout_secs == 0 {
            return Err(anyhow!("dependencies.timeout_secs must be > 0"));
        }
        if self.heartbeat.interval_secs == 0 || self.heartbeat.maintenance_interval_secs == 0 {
            return Err(anyhow!("heartbeat intervals must be > 0"));
        }
        if self.tests.timeout_secs == Some(0) {
            return Err(anyhow!("tests.timeout_secs must be > 0 when set"));
        }
        if self.tests.output_limit_bytes == 0 {
            return Err(anyhow!("tests.output_limit_bytes must be > 0"));
        }
        if self.worker.output_limit_bytes == 0 {
            return Err(anyhow!("worker.output_limit_bytes must be > 0"));
        }
        if self.worker.timeout_secs == Some(0) {
            return Err(anyhow!("worker.timeout_secs must be > 0 when set"));
        }
        if self.worker.command.is_empty() || self.worker.command[0].trim().is_empty() {
            return Err(anyhow!("worker.command must be a non-empty array"));
        }
        if self
            .freshness
            .worker_checkpoints_secs
            .windows(2)
            .any(|w| w[0] >= w[1])
        {
            return Err(anyhow!(
                "freshness.worker_checkpoints_secs must be strictly increasing"
            ));
        }
        for (base, patterns) in &self.artifacts {
            for pattern in [&patterns.tests, &patterns.implementation]
                .into_iter()
                .flatten()
            {
                glob::Pattern::new(pattern)
                    .with_context(|| format!("artifacts.{base}: invalid glob {pattern:?}"))?;
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.dependencies.poll_interval_secs)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.dependencies.timeout_secs)
    }

    pub fn worker_checkpoints(&self) -> Vec<Duration> {
        self.freshness
            .worker_checkpoints_secs
            .iter()
            .copied()
            .map(Duration::from_secs)
            .collect()
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ControllerConfig::default()`.
pub fn load_config(path: &Path) -> Result<ControllerConfig> {
    if !path.exists() {
        let cfg = ControllerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ControllerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, ControllerConfig::default());
        assert_eq!(cfg.poll_interval(), Duration::from_secs(30));
        assert_eq!(cfg.dependency_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.tests.timeout(), None);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("converge.toml");
        fs::write(
            &path,
            "[dependencies]\npoll_interval_secs = 5\n\n[artifacts.cart]\nimpl = \"lib/cart/**\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.dependencies.poll_interval_secs, 5);
        assert_eq!(cfg.dependencies.timeout_secs, 3600);
        assert_eq!(
            cfg.artifacts["cart"].implementation.as_deref(),
            Some("lib/cart/**")
        );
        assert_eq!(cfg.worker, WorkerConfig::default());
    }

    #[test]
    fn rejects_unordered_checkpoints() {
        let mut cfg = ControllerConfig::default();
        cfg.freshness.worker_checkpoints_secs = vec![60, 30];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn rejects_empty_worker_command() {
        let mut cfg = ControllerConfig::default();
        cfg.worker.command.clear();
        assert!(cfg.validate().is_err());
    }
}
