//! Best-effort extraction of pass/fail counts from test command output.
//!
//! Parsing never fails: unrecognized output yields zero counts so a parser
//! mismatch cannot block convergence.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

const DEFAULT_PASS_PATTERNS: [&str; 3] = [
    r"(?i)\b(\d+)\s+(?:tests?\s+)?passed\b",
    r"(?i)\b(\d+)\s+passing\b",
    r"(?i)\bpass(?:ed)?\s*[:=]\s*(\d+)",
];

const DEFAULT_FAIL_PATTERNS: [&str; 3] = [
    r"(?i)\b(\d+)\s+(?:tests?\s+)?failed\b",
    r"(?i)\b(\d+)\s+failing\b",
    r"(?i)\bfail(?:ed|ures?)?\s*[:=]\s*(\d+)",
];

/// Pass/fail counts observed in one test run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub pass: u32,
    pub fail: u32,
}

impl TestCounts {
    pub fn new(pass: u32, fail: u32) -> Self {
        Self { pass, fail }
    }

    pub fn total(&self) -> u64 {
        u64::from(self.pass) + u64::from(self.fail)
    }

    /// Integer percentage, rounded down; zero when no tests were observed.
    pub fn pass_rate(&self) -> u32 {
        pass_rate(self.pass, self.fail)
    }
}

/// `floor(pass * 100 / (pass + fail))`, or 0 when `pass + fail == 0`.
pub fn pass_rate(pass: u32, fail: u32) -> u32 {
    let total = u64::from(pass) + u64::from(fail);
    if total == 0 {
        return 0;
    }
    (u64::from(pass) * 100 / total) as u32
}

/// Pluggable summary parser. `None` means nothing recognizable was found.
pub trait MetricsParser {
    fn parse(&self, output: &str) -> Option<TestCounts>;
}

/// Parse with `parser`, defaulting to zero counts on a miss.
pub fn extract_counts(parser: &dyn MetricsParser, output: &str) -> TestCounts {
    parser.parse(output).unwrap_or_default()
}

/// Regex-family parser for common runner summaries (pytest, cargo, jest,
/// mocha, `passed: N`-style).
///
/// Pass and fail counts are taken independently: for each field the first
/// pattern (in priority order) that matches anywhere wins, and its first
/// match supplies the count.
#[derive(Debug, Clone)]
pub struct SummaryParser {
    pass: Vec<Regex>,
    fail: Vec<Regex>,
}

impl Default for SummaryParser {
    fn default() -> Self {
        Self {
            pass: compile_builtin(&DEFAULT_PASS_PATTERNS),
            fail: compile_builtin(&DEFAULT_FAIL_PATTERNS),
        }
    }
}

impl SummaryParser {
    /// Build a parser whose custom patterns take priority over the built-ins.
    ///
    /// Each custom pattern must have one capture group holding the count.
    pub fn with_patterns(extra_pass: &[String], extra_fail: &[String]) -> Result<Self> {
        let mut parser = Self::default();
        parser.pass = compile_custom(extra_pass)?
            .into_iter()
            .chain(parser.pass)
            .collect();
        parser.fail = compile_custom(extra_fail)?
            .into_iter()
            .chain(parser.fail)
            .collect();
        Ok(parser)
    }
}

impl MetricsParser for SummaryParser {
    fn parse(&self, output: &str) -> Option<TestCounts> {
        let pass = first_count(&self.pass, output);
        let fail = first_count(&self.fail, output);
        if pass.is_none() && fail.is_none() {
            return None;
        }
        Some(TestCounts {
            pass: pass.unwrap_or(0),
            fail: fail.unwrap_or(0),
        })
    }
}

fn first_count(patterns: &[Regex], output: &str) -> Option<u32> {
    patterns.iter().find_map(|re| {
        re.captures(output)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
    })
}

fn compile_builtin(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("built-in metric pattern should compile"))
        .collect()
}

fn compile_custom(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("compile metric pattern '{p}'")))
        .collect()
}
