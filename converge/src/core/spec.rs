//! Agent identity and dependency classification.
//!
//! Dependency kinds and workspace strategies are derived from naming
//! conventions exactly once, when the `AgentSpec` is built. Pollers match on the
//! resulting variants and never look at name suffixes again.

use std::sync::LazyLock;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Default number of cycles before an agent gives up.
pub const DEFAULT_MAX_CYCLES: u32 = 10;
/// Default pass-rate percentage that counts as converged.
pub const DEFAULT_TARGET_PASS_RATE: u32 = 85;

const PROCESS_SUFFIXES: [&str; 3] = ["-refactor", "-audit", "-integration-final"];

static FINALIZATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|-)final(?:ize|ization)?(?:-|$)").expect("finalization regex should compile")
});

static AGENT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("agent name regex should compile")
});

/// How a dependency's readiness is decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencyKind {
    /// `<base>-tests`: ready once test files for `base` exist.
    TestArtifact { base: String },
    /// `<base>-impl`: ready once non-test implementation files for `base` exist.
    ImplArtifact { base: String },
    /// `*-refactor`, `*-audit`, `*-integration-final`: ready via handoff or a
    /// `completed`/`success` status record.
    ProcessOutcome,
    /// Anything else: ready once a handoff record exists.
    Generic,
}

impl DependencyKind {
    pub fn classify(name: &str) -> Self {
        if let Some(base) = name.strip_suffix("-tests") {
            return Self::TestArtifact {
                base: base.to_string(),
            };
        }
        if let Some(base) = name.strip_suffix("-impl") {
            return Self::ImplArtifact {
                base: base.to_string(),
            };
        }
        if PROCESS_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            return Self::ProcessOutcome;
        }
        Self::Generic
    }
}

/// A declared upstream agent with its precomputed kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub kind: DependencyKind,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let kind = DependencyKind::classify(&name);
        Self { name, kind }
    }
}

/// Parse a comma-separated dependency list, ignoring blanks.
pub fn parse_dependencies(raw: &str) -> Vec<Dependency> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Dependency::new)
        .collect()
}

/// Which agents share mutable workspace storage with this one.
///
/// Agents sharing a `Layer` or `Unified` workspace can see each other's
/// uncommitted writes. Nothing here locks that storage; such agents must not
/// run at the same time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum WorkspaceStrategy {
    Isolated,
    Layer { base: String },
    Unified,
}

impl WorkspaceStrategy {
    /// Derive the strategy from the naming convention.
    pub fn derive(agent: &str) -> Self {
        if FINALIZATION_RE.is_match(agent) {
            return Self::Unified;
        }
        match layer_base(agent) {
            Some(base) => Self::Layer {
                base: base.to_string(),
            },
            None => Self::Isolated,
        }
    }

    /// Parse an explicit strategy name (`isolated`, `layer`, `unified`).
    pub fn parse(value: &str, agent: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "isolated" => Ok(Self::Isolated),
            "unified" => Ok(Self::Unified),
            "layer" => Ok(Self::Layer {
                base: layer_base(agent).unwrap_or(agent).to_string(),
            }),
            other => Err(anyhow!(
                "unknown workspace strategy '{other}' (expected isolated, layer or unified)"
            )),
        }
    }

    /// Directory key under the workspaces root.
    pub fn workspace_key<'a>(&'a self, agent: &'a str) -> &'a str {
        match self {
            Self::Isolated => agent,
            Self::Layer { base } => base,
            Self::Unified => "unified",
        }
    }
}

fn layer_base(agent: &str) -> Option<&str> {
    agent
        .strip_suffix("-tests")
        .or_else(|| agent.strip_suffix("-impl"))
        .filter(|base| !base.is_empty())
}

/// Immutable per-run description of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub depends_on: Vec<Dependency>,
    pub test_command: String,
    pub max_cycles: u32,
    /// Percentage in `0..=100`.
    pub target_pass_rate: u32,
    /// Minimum number of observed tests before a pass rate may count as converged.
    pub min_total_tests: u32,
    pub workspace: WorkspaceStrategy,
    /// Read-only analysis mode for the worker.
    pub debug: bool,
}

impl AgentSpec {
    pub fn new(name: impl Into<String>, test_command: impl Into<String>) -> Self {
        let name = name.into();
        let workspace = WorkspaceStrategy::derive(&name);
        Self {
            name,
            depends_on: Vec::new(),
            test_command: test_command.into(),
            max_cycles: DEFAULT_MAX_CYCLES,
            target_pass_rate: DEFAULT_TARGET_PASS_RATE,
            min_total_tests: 0,
            workspace,
            debug: false,
        }
    }

    pub fn with_dependencies<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = names.into_iter().map(Dependency::new).collect();
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_agent_name(&self.name)?;
        if self.test_command.trim().is_empty() {
            return Err(anyhow!("test command must be non-empty"));
        }
        if self.max_cycles == 0 {
            return Err(anyhow!("max cycles must be > 0"));
        }
        if self.target_pass_rate > 100 {
            return Err(anyhow!(
                "target pass rate must be within 0..=100 (got {})",
                self.target_pass_rate
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for dep in &self.depends_on {
            validate_agent_name(&dep.name)?;
            if dep.name == self.name {
                return Err(anyhow!("agent '{}' cannot depend on itself", self.name));
            }
            if !seen.insert(dep.name.as_str()) {
                return Err(anyhow!("duplicate dependency '{}'", dep.name));
            }
        }
        Ok(())
    }

    pub fn dependency_names(&self) -> Vec<String> {
        self.depends_on.iter().map(|dep| dep.name.clone()).collect()
    }
}

/// Agent names double as record file names, so keep them path-safe.
pub fn validate_agent_name(name: &str) -> Result<()> {
    if !AGENT_NAME_RE.is_match(name) {
        return Err(anyhow!(
            "invalid agent name '{name}' (use letters, digits, '.', '_' or '-')"
        ));
    }
    Ok(())
}
