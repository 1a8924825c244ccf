//! Test command adapter: run the configured shell command and extract counts.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::metrics::{MetricsParser, SummaryParser, TestCounts, extract_counts};
use crate::io::process::run_command;

#[derive(Debug, Clone)]
pub struct TestRequest {
    /// Shell command line, run through `sh -c`.
    pub command: String,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
    /// `None` lets the command's own behavior govern.
    pub timeout: Option<Duration>,
    pub output_limit_bytes: usize,
}

/// One test-suite execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    pub counts: TestCounts,
    /// Combined stdout and stderr.
    pub raw_output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl TestRun {
    pub fn pass_rate(&self) -> u32 {
        self.counts.pass_rate()
    }
}

pub trait TestRunner {
    /// Run the suite. A failing suite is a normal result; only failure to run
    /// the command at all is an error.
    fn run(&self, request: &TestRequest) -> Result<TestRun>;
}

/// Runs the command through `sh -c` and parses summary lines.
pub struct ShellTestRunner<P = SummaryParser> {
    parser: P,
}

impl ShellTestRunner {
    pub fn new() -> Self {
        Self {
            parser: SummaryParser::default(),
        }
    }
}

impl Default for ShellTestRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MetricsParser> ShellTestRunner<P> {
    pub fn with_parser(parser: P) -> Self {
        Self { parser }
    }
}

impl<P: MetricsParser> TestRunner for ShellTestRunner<P> {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &TestRequest) -> Result<TestRun> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir);

        let output = run_command(cmd, None, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run test command `{}`", request.command))?;
        let raw_output = output.combined("tests");
        write_test_log(&request.log_path, &raw_output)?;

        if output.timed_out {
            warn!("test command timed out; counting what it printed");
        }
        let counts = extract_counts(&self.parser, &raw_output);
        info!(
            pass = counts.pass,
            fail = counts.fail,
            rate = counts.pass_rate(),
            exit_code = ?output.status.code(),
            "test run finished"
        );
        Ok(TestRun {
            counts,
            raw_output,
            exit_code: output.status.code(),
            timed_out: output.timed_out,
        })
    }
}

fn write_test_log(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create test log dir {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write test log {}", path.display()))?;
    debug!(path = %path.display(), "test log written");
    Ok(())
}
