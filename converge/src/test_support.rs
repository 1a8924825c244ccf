//! Test-only helpers: scripted test runner and worker, plus a state-root fixture.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs::{self, File};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tempfile::TempDir;

use crate::core::metrics::TestCounts;
use crate::core::spec::AgentSpec;
use crate::core::types::{SignalOutcome, SignalRecord};
use crate::cycle::Agent;
use crate::io::config::ControllerConfig;
use crate::io::layout::StateLayout;
use crate::io::record_store::write_json;
use crate::io::test_runner::{TestRequest, TestRun, TestRunner};
use crate::io::worker::{Worker, WorkerObserver, WorkerOutcome, WorkerRequest};

/// Counts out of 100 tests with exactly `rate` percent passing.
pub fn counts_for_rate(rate: u32) -> TestCounts {
    TestCounts::new(rate, 100 - rate)
}

/// Set a file's modification time.
pub fn set_mtime(path: &Path, time: SystemTime) -> Result<()> {
    File::options().write(true).open(path)?.set_modified(time)?;
    Ok(())
}

type RunHook = Box<dyn Fn(usize)>;

/// Test runner that replays queued counts, one per run.
pub struct ScriptedTestRunner {
    queue: RefCell<VecDeque<TestCounts>>,
    runs: Cell<usize>,
    after_run: Option<RunHook>,
}

impl ScriptedTestRunner {
    pub fn new(counts: Vec<TestCounts>) -> Self {
        Self {
            queue: RefCell::new(counts.into()),
            runs: Cell::new(0),
            after_run: None,
        }
    }

    /// Called with the 1-based run number once each run has produced its counts.
    pub fn with_after_run(mut self, hook: impl Fn(usize) + 'static) -> Self {
        self.after_run = Some(Box::new(hook));
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.get()
    }

    pub fn remaining(&self) -> usize {
        self.queue.borrow().len()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestRun> {
        let counts = self
            .queue
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("no scripted test run left"))?;
        self.runs.set(self.runs.get() + 1);
        let raw_output = format!("{} passed, {} failed\n", counts.pass, counts.fail);
        if let Some(parent) = request.log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&request.log_path, &raw_output)?;
        if let Some(hook) = &self.after_run {
            hook(self.runs.get());
        }
        Ok(TestRun {
            counts,
            raw_output,
            exit_code: Some(if counts.fail == 0 { 0 } else { 1 }),
            timed_out: false,
        })
    }
}

type InvokeHook = Box<dyn Fn(&WorkerRequest)>;

/// One scripted worker invocation.
#[derive(Default)]
pub struct ScriptedInvocation {
    pub lines: Vec<String>,
    /// Runs before any line is emitted; used to change shared state mid-worker.
    pub on_invoke: Option<InvokeHook>,
    pub error: Option<String>,
}

impl ScriptedInvocation {
    pub fn lines(lines: &[&str]) -> Self {
        Self {
            lines: lines.iter().map(|l| (*l).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    pub fn with_hook(mut self, hook: impl Fn(&WorkerRequest) + 'static) -> Self {
        self.on_invoke = Some(Box::new(hook));
        self
    }
}

/// Worker that replays scripted transcripts and fires every configured checkpoint.
pub struct ScriptedWorker {
    queue: RefCell<VecDeque<ScriptedInvocation>>,
    invocations: Cell<usize>,
    last_request: RefCell<Option<WorkerRequest>>,
}

impl ScriptedWorker {
    pub fn new(invocations: Vec<ScriptedInvocation>) -> Self {
        Self {
            queue: RefCell::new(invocations.into()),
            invocations: Cell::new(0),
            last_request: RefCell::new(None),
        }
    }

    pub fn invocations(&self) -> usize {
        self.invocations.get()
    }

    pub fn last_request(&self) -> Option<WorkerRequest> {
        self.last_request.borrow().clone()
    }
}

impl Worker for ScriptedWorker {
    fn invoke(
        &self,
        request: &WorkerRequest,
        observer: &mut dyn WorkerObserver,
    ) -> Result<WorkerOutcome> {
        self.invocations.set(self.invocations.get() + 1);
        *self.last_request.borrow_mut() = Some(request.clone());
        let script = self.queue.borrow_mut().pop_front().unwrap_or_default();
        if let Some(message) = script.error {
            return Err(anyhow!(message));
        }
        if let Some(hook) = &script.on_invoke {
            hook(request);
        }

        if let Some(parent) = request.transcript_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut transcript = script.lines.join("\n");
        transcript.push('\n');
        fs::write(&request.transcript_path, transcript)?;

        for line in &script.lines {
            observer.on_line(line);
        }
        for index in 0..request.checkpoints.len() {
            if let ControlFlow::Break(()) = observer.on_checkpoint(index)? {
                return Ok(WorkerOutcome::Interrupted { checkpoint: index });
            }
        }
        Ok(WorkerOutcome::Finished {
            exit_code: Some(0),
            timed_out: false,
        })
    }
}

/// Temporary state root and project directory for one agent.
pub struct Fixture {
    temp: TempDir,
    pub spec: AgentSpec,
    pub config: ControllerConfig,
}

impl Fixture {
    pub fn new(agent: &str) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let project = temp.path().join("project");
        fs::create_dir_all(&project).expect("create project dir");

        let mut config = ControllerConfig::default();
        config.dependencies.poll_interval_secs = 1;
        config.dependencies.timeout_secs = 1;
        config.workspace.project_root = project;
        Self {
            temp,
            spec: AgentSpec::new(agent, "scripted"),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp.path().join("state")
    }

    pub fn project_dir(&self) -> PathBuf {
        self.temp.path().join("project")
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(self.state_dir())
    }

    /// A freshly built agent, as a restarted process would build it.
    pub fn agent(&self) -> Agent {
        Agent::new(self.spec.clone(), self.config.clone(), self.layout()).expect("agent")
    }

    /// Publish a success handoff for another agent, backdated so it predates any marker.
    pub fn publish_handoff(&self, agent: &str) -> PathBuf {
        let path = self.layout().handoff_path(agent);
        let record = SignalRecord {
            agent: agent.to_string(),
            outcome: SignalOutcome::Success,
            cycle: 1,
            tests_pass: 10,
            tests_fail: 0,
            test_pass_rate: 100,
            target_pass_rate: 85,
            summary: "done".to_string(),
            written_at: Utc::now(),
        };
        write_json(&path, &record, None).expect("write handoff");
        set_mtime(
            &path,
            SystemTime::now() - std::time::Duration::from_secs(60),
        )
        .expect("backdate handoff");
        path
    }
}
