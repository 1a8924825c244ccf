//! Context bundle handed to the worker on stdin each cycle.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::metrics::TestCounts;

const WORKER_CONTEXT_TEMPLATE: &str = include_str!("prompts/worker_context.md");

#[derive(Debug, Clone, Serialize)]
struct MetricsContext {
    pass: u32,
    fail: u32,
    rate: u32,
}

impl From<&TestCounts> for MetricsContext {
    fn from(counts: &TestCounts) -> Self {
        Self {
            pass: counts.pass,
            fail: counts.fail,
            rate: counts.pass_rate(),
        }
    }
}

/// Inputs for one rendered bundle.
#[derive(Debug, Clone)]
pub struct ContextBundle {
    pub agent: String,
    pub cycle: u32,
    pub max_cycles: u32,
    pub read_only: bool,
    pub baseline: TestCounts,
    pub target_pass_rate: u32,
    pub min_total_tests: u32,
    pub test_command: String,
    pub dependencies: Vec<String>,
    pub feedback: Option<String>,
    /// Work summary recorded by the previous cycle.
    pub previous_summary: Option<String>,
    /// Trailing lines of the baseline test output.
    pub test_tail: String,
}

/// Render the bundle from the embedded template.
pub fn render_bundle(bundle: &ContextBundle) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("worker_context", WORKER_CONTEXT_TEMPLATE)?;
    let template = env.get_template("worker_context")?;
    let rendered = template.render(context! {
        agent => &bundle.agent,
        cycle => bundle.cycle,
        max_cycles => bundle.max_cycles,
        read_only => bundle.read_only,
        metrics => MetricsContext::from(&bundle.baseline),
        target_pass_rate => bundle.target_pass_rate,
        min_total_tests => bundle.min_total_tests,
        test_command => bundle.test_command.trim(),
        dependencies => &bundle.dependencies,
        feedback => bundle.feedback.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        previous_summary => bundle.previous_summary.as_deref().map(str::trim).filter(|s| !s.is_empty()),
        test_tail => (!bundle.test_tail.trim().is_empty()).then(|| bundle.test_tail.trim_end()),
    })?;
    debug!(
        bytes = rendered.len(),
        has_feedback = bundle.feedback.is_some(),
        "rendered worker context"
    );
    let mut rendered = rendered;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    Ok(rendered)
}

/// Last `max_lines` lines of `text`.
pub fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
