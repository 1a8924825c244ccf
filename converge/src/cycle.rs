//! One pass of the per-agent lifecycle state machine.
//!
//! A cycle reads the persisted counter, waits for dependencies, measures a
//! baseline, invokes the worker, re-measures, and persists everything before
//! returning. Each step writes its records before the next one starts, so a
//! process killed at any point resumes from the records alone.

use std::fmt;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::core::convergence::{ConvergenceCriteria, CyclePlan, plan_cycle, work_summary};
use crate::core::metrics::TestCounts;
use crate::core::scrape::scan_line;
use crate::core::spec::{AgentSpec, Dependency};
use crate::core::types::{LifecycleStatus, SignalOutcome, SignalRecord};
use crate::io::config::ControllerConfig;
use crate::io::context::{ContextBundle, render_bundle, tail_lines};
use crate::io::cycle_counter::CycleCounter;
use crate::io::cycle_log::{CycleEnd, CycleMeta, CyclePaths};
use crate::io::layout::{AgentPaths, StateLayout};
use crate::io::marker::StartMarker;
use crate::io::progress::ProgressLog;
use crate::io::resolver::{DependencyTimeoutError, Freshness, Resolver};
use crate::io::signals::{read_feedback, write_blocker, write_handoff};
use crate::io::status::StatusStore;
use crate::io::test_runner::{TestRequest, TestRun, TestRunner};
use crate::io::worker::{Worker, WorkerObserver, WorkerOutcome, WorkerRequest};

/// Every record owned by one agent.
#[derive(Debug, Clone)]
pub struct AgentRecords {
    pub paths: AgentPaths,
    pub status: StatusStore,
    pub counter: CycleCounter,
    pub marker: StartMarker,
    pub progress: ProgressLog,
}

impl AgentRecords {
    pub fn open(layout: &StateLayout, agent: &str) -> Self {
        let paths = layout.agent(agent);
        Self {
            status: StatusStore::new(agent, &paths.status_path),
            counter: CycleCounter::new(&paths.counter_path),
            marker: StartMarker::new(&paths.marker_path),
            progress: ProgressLog::new(agent, &paths.progress_path),
            paths,
        }
    }
}

/// An agent bound to its configuration and records.
///
/// Holds no cycle state of its own: building a fresh `Agent` from the same
/// inputs after a crash resumes exactly where the records say.
#[derive(Debug, Clone)]
pub struct Agent {
    pub spec: AgentSpec,
    pub config: ControllerConfig,
    pub layout: StateLayout,
    pub records: AgentRecords,
}

impl Agent {
    pub fn new(spec: AgentSpec, config: ControllerConfig, layout: StateLayout) -> Result<Self> {
        spec.validate().context("invalid agent")?;
        config.validate().context("invalid config")?;
        let records = AgentRecords::open(&layout, &spec.name);
        Ok(Self {
            spec,
            config,
            layout,
            records,
        })
    }

    pub fn project_root(&self) -> PathBuf {
        self.config.workspace.project_root.clone()
    }

    /// Directory the worker and the test command run in.
    pub fn workdir(&self) -> PathBuf {
        match &self.config.workspace.workspaces_dir {
            Some(dir) => dir.join(self.spec.workspace.workspace_key(&self.spec.name)),
            None => self.project_root(),
        }
    }

    pub fn resolver(&self) -> Resolver {
        Resolver::new(self.layout.clone(), self.project_root(), &self.config)
    }

    pub fn criteria(&self) -> ConvergenceCriteria {
        ConvergenceCriteria {
            target_pass_rate: self.spec.target_pass_rate,
            min_total_tests: self.spec.min_total_tests,
        }
    }
}

/// Where a freshness check happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checkpoint {
    BeforeWorker,
    /// Index into the configured worker checkpoint offsets.
    DuringWorker(usize),
    AfterPostTest,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeWorker => write!(f, "before worker"),
            Self::DuringWorker(index) => write!(f, "during worker (checkpoint {})", index + 1),
            Self::AfterPostTest => write!(f, "after post-test"),
        }
    }
}

/// Terminal result: the agent has published its signal and should idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub cycle: u32,
    pub outcome: SignalOutcome,
    pub counts: TestCounts,
    pub reason: Option<String>,
    /// Settled by an earlier process; nothing was re-run or rewritten.
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Converged or exhausted; enter maintenance.
    Settled(Settlement),
    /// Worker and post-test ran; the next cycle re-evaluates.
    Completed {
        cycle: u32,
        baseline: TestCounts,
        post: TestCounts,
    },
    /// A dependency changed; the cycle does not count as an attempt.
    Restart {
        cycle: u32,
        checkpoint: Checkpoint,
        updated: Vec<String>,
    },
}

/// Run one cycle (or settle) from whatever the records currently say.
#[instrument(skip_all, fields(agent = %agent.spec.name))]
pub fn run_cycle<T: TestRunner, W: Worker>(
    agent: &Agent,
    tests: &T,
    worker: &W,
) -> Result<CycleOutcome> {
    if let Some(settlement) = resume_settlement(agent)? {
        info!(outcome = ?settlement.outcome, cycle = settlement.cycle, "already settled");
        return Ok(CycleOutcome::Settled(settlement));
    }

    let counter = agent.records.counter.load()?;
    match plan_cycle(counter, agent.spec.max_cycles) {
        CyclePlan::Exhausted { cycles_run } => {
            final_test_run(agent, tests, cycles_run).map(CycleOutcome::Settled)
        }
        CyclePlan::Run { cycle } => run_planned_cycle(agent, tests, worker, cycle),
    }
}

fn resume_settlement(agent: &Agent) -> Result<Option<Settlement>> {
    let records = &agent.records;
    let Some(status) = records.status.load()? else {
        return Ok(None);
    };
    if status.status == LifecycleStatus::Completed && records.paths.handoff_path.exists() {
        return Ok(Some(Settlement {
            cycle: status.restart_cycle,
            outcome: SignalOutcome::Success,
            counts: status.counts(),
            reason: None,
            resumed: true,
        }));
    }
    let counter = records.counter.load()?;
    if counter >= agent.spec.max_cycles && records.paths.blocker_path.exists() {
        return Ok(Some(Settlement {
            cycle: counter,
            outcome: SignalOutcome::Failure,
            counts: status.counts(),
            reason: status.reason,
            resumed: true,
        }));
    }
    Ok(None)
}

fn run_planned_cycle<T: TestRunner, W: Worker>(
    agent: &Agent,
    tests: &T,
    worker: &W,
    cycle: u32,
) -> Result<CycleOutcome> {
    let started = Instant::now();
    let started_at = Utc::now();
    let records = &agent.records;
    let spec = &agent.spec;

    // Count the attempt before anything else can fail.
    records.counter.store(cycle)?;
    records.status.update(|s| {
        s.begin_cycle(cycle);
        s.status = LifecycleStatus::Initializing;
    })?;
    records
        .progress
        .append(&format!("cycle {cycle}/{}: started", spec.max_cycles))?;
    info!(cycle, max_cycles = spec.max_cycles, "cycle started");

    let resolver = agent.resolver();
    if let Err(err) =
        resolver.wait_for_readiness(&spec.depends_on, agent.config.dependency_timeout())
    {
        if let Some(timeout) = err.downcast_ref::<DependencyTimeoutError>() {
            let reason = timeout.to_string();
            records.status.update(|s| {
                s.status = LifecycleStatus::Stopped;
                s.reason = Some(reason.clone());
            })?;
            records.progress.append(&format!("cycle {cycle}: {reason}"))?;
        }
        return Err(err);
    }
    let anchor = records.marker.stamp()?;
    records
        .status
        .update(|s| s.status = LifecycleStatus::Working)?;

    let cycle_paths = CyclePaths::new(records.paths.cycle_dir(cycle));
    cycle_paths.prepare()?;
    let mut meta = CycleMeta {
        agent: spec.name.clone(),
        cycle,
        started_at,
        baseline_rate: None,
        post_rate: None,
        outcome: CycleEnd::Completed,
        duration_ms: 0,
    };

    let baseline = run_tests(agent, tests, cycle_paths.baseline_log_path.clone())?;
    meta.baseline_rate = Some(baseline.pass_rate());
    records
        .status
        .update(|s| s.record_counts(&baseline.counts))?;
    records.progress.append(&format!(
        "cycle {cycle}: baseline {}% ({} passed, {} failed)",
        baseline.pass_rate(),
        baseline.counts.pass,
        baseline.counts.fail
    ))?;

    if agent.criteria().is_met(&baseline.counts) {
        let settlement = settle_success(agent, cycle, baseline.counts)?;
        finish_meta(&cycle_paths, &mut meta, CycleEnd::Converged, started)?;
        return Ok(CycleOutcome::Settled(settlement));
    }

    if let Freshness::Stale { updated } = resolver.check_freshness(&spec.depends_on, anchor)? {
        return restart(
            agent,
            &cycle_paths,
            &mut meta,
            started,
            Checkpoint::BeforeWorker,
            updated,
        );
    }

    let feedback = read_feedback(&records.paths.feedback_path)?;
    let previous_summary = records
        .status
        .load()?
        .and_then(|status| status.work_summary);
    let bundle = render_bundle(&ContextBundle {
        agent: spec.name.clone(),
        cycle,
        max_cycles: spec.max_cycles,
        read_only: spec.debug,
        baseline: baseline.counts,
        target_pass_rate: spec.target_pass_rate,
        min_total_tests: spec.min_total_tests,
        test_command: spec.test_command.clone(),
        dependencies: spec.dependency_names(),
        feedback,
        previous_summary,
        test_tail: tail_lines(&baseline.raw_output, agent.config.tests.context_lines),
    })?;
    cycle_paths.write_context(&bundle)?;

    let request = WorkerRequest {
        agent: spec.name.clone(),
        cycle,
        workdir: agent.workdir(),
        bundle,
        read_only: spec.debug,
        transcript_path: cycle_paths.worker_log_path.clone(),
        timeout: agent.config.worker.timeout(),
        checkpoints: agent.config.worker_checkpoints(),
        output_limit_bytes: agent.config.worker.output_limit_bytes,
    };
    let mut observer = CycleObserver {
        status: &records.status,
        resolver: &resolver,
        deps: &spec.depends_on,
        anchor,
        stale: None,
    };
    records
        .progress
        .append(&format!("cycle {cycle}: worker invoked"))?;
    let outcome = worker
        .invoke(&request, &mut observer)
        .with_context(|| format!("worker invocation for cycle {cycle}"))?;
    match outcome {
        WorkerOutcome::Interrupted { checkpoint } => {
            let updated = observer.stale.take().unwrap_or_default();
            return restart(
                agent,
                &cycle_paths,
                &mut meta,
                started,
                Checkpoint::DuringWorker(checkpoint),
                updated,
            );
        }
        WorkerOutcome::Finished {
            exit_code,
            timed_out,
        } => {
            records.progress.append(&format!(
                "cycle {cycle}: worker finished (exit {}{})",
                exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()),
                if timed_out { ", timed out" } else { "" }
            ))?;
        }
    }

    let post = run_tests(agent, tests, cycle_paths.post_log_path.clone())?;
    meta.post_rate = Some(post.pass_rate());
    let summary = work_summary(cycle, &baseline.counts, &post.counts);
    records.status.update(|s| {
        s.record_counts(&post.counts);
        s.work_summary = Some(summary.clone());
    })?;
    records.progress.append(&summary)?;

    if let Freshness::Stale { updated } = resolver.check_freshness(&spec.depends_on, anchor)? {
        return restart(
            agent,
            &cycle_paths,
            &mut meta,
            started,
            Checkpoint::AfterPostTest,
            updated,
        );
    }

    finish_meta(&cycle_paths, &mut meta, CycleEnd::Completed, started)?;
    info!(cycle, baseline = baseline.pass_rate(), post = post.pass_rate(), "cycle completed");
    Ok(CycleOutcome::Completed {
        cycle,
        baseline: baseline.counts,
        post: post.counts,
    })
}

/// Cycle budget spent: one last measurement decides the published signal.
fn final_test_run<T: TestRunner>(agent: &Agent, tests: &T, cycles_run: u32) -> Result<Settlement> {
    let records = &agent.records;
    let started = Instant::now();
    let started_at = Utc::now();
    info!(cycles_run, "cycle budget spent; running final tests");
    records.progress.append(&format!(
        "cycle budget spent after {cycles_run} cycles: final test run"
    ))?;

    let cycle_paths = CyclePaths::new(records.paths.final_run_dir());
    cycle_paths.prepare()?;
    let run = run_tests(agent, tests, cycle_paths.baseline_log_path.clone())?;
    records.status.update(|s| s.record_counts(&run.counts))?;

    let mut meta = CycleMeta {
        agent: agent.spec.name.clone(),
        cycle: cycles_run,
        started_at,
        baseline_rate: Some(run.pass_rate()),
        post_rate: None,
        outcome: CycleEnd::Exhausted,
        duration_ms: 0,
    };
    if agent.criteria().is_met(&run.counts) {
        let settlement = settle_success(agent, cycles_run, run.counts)?;
        finish_meta(&cycle_paths, &mut meta, CycleEnd::Converged, started)?;
        return Ok(settlement);
    }

    let reason = format!(
        "max cycles ({}) reached at {}% (target {}%)",
        agent.spec.max_cycles,
        run.pass_rate(),
        agent.spec.target_pass_rate
    );
    let summary = records
        .status
        .load()?
        .and_then(|s| s.work_summary)
        .unwrap_or_else(|| reason.clone());
    write_blocker(
        &records.paths,
        &signal_record(agent, SignalOutcome::Failure, cycles_run, run.counts, summary),
    )?;
    records.status.update(|s| {
        s.status = LifecycleStatus::Stopped;
        s.reason = Some(reason.clone());
    })?;
    records.progress.append(&format!("blocked: {reason}"))?;
    warn!(%reason, "agent blocked");
    finish_meta(&cycle_paths, &mut meta, CycleEnd::Exhausted, started)?;

    Ok(Settlement {
        cycle: cycles_run,
        outcome: SignalOutcome::Failure,
        counts: run.counts,
        reason: Some(reason),
        resumed: false,
    })
}

fn settle_success(agent: &Agent, cycle: u32, counts: TestCounts) -> Result<Settlement> {
    let records = &agent.records;
    let summary = format!(
        "converged at {}% (target {}%) in cycle {cycle}",
        counts.pass_rate(),
        agent.spec.target_pass_rate
    );
    records.status.update(|s| {
        s.status = LifecycleStatus::Completed;
        s.record_counts(&counts);
        s.reason = None;
        if s.work_summary.is_none() {
            s.work_summary = Some(summary.clone());
        }
    })?;
    write_handoff(
        &records.paths,
        &signal_record(agent, SignalOutcome::Success, cycle, counts, summary.clone()),
    )?;
    records.progress.append(&summary)?;
    info!(cycle, rate = counts.pass_rate(), "converged");
    Ok(Settlement {
        cycle,
        outcome: SignalOutcome::Success,
        counts,
        reason: None,
        resumed: false,
    })
}

fn restart(
    agent: &Agent,
    cycle_paths: &CyclePaths,
    meta: &mut CycleMeta,
    started: Instant,
    checkpoint: Checkpoint,
    updated: Vec<String>,
) -> Result<CycleOutcome> {
    let records = &agent.records;
    let cycle = meta.cycle;
    let reason = format!("dependency updated {checkpoint}: {}", updated.join(", "));
    records.status.update(|s| {
        s.reason = Some(reason.clone());
        s.restart_cycle = cycle - 1;
    })?;
    // Freshness restarts are not attempts.
    records.counter.store(cycle - 1)?;
    records
        .progress
        .append(&format!("cycle {cycle}: restarting, {reason}"))?;
    finish_meta(cycle_paths, meta, CycleEnd::Restarted, started)?;
    info!(cycle, %checkpoint, updated = ?updated, "restarting for fresh dependencies");
    Ok(CycleOutcome::Restart {
        cycle,
        checkpoint,
        updated,
    })
}

fn run_tests<T: TestRunner>(agent: &Agent, tests: &T, log_path: PathBuf) -> Result<TestRun> {
    tests.run(&TestRequest {
        command: agent.spec.test_command.clone(),
        workdir: agent.workdir(),
        log_path,
        timeout: agent.config.tests.timeout(),
        output_limit_bytes: agent.config.tests.output_limit_bytes,
    })
}

fn signal_record(
    agent: &Agent,
    outcome: SignalOutcome,
    cycle: u32,
    counts: TestCounts,
    summary: String,
) -> SignalRecord {
    SignalRecord {
        agent: agent.spec.name.clone(),
        outcome,
        cycle,
        tests_pass: counts.pass,
        tests_fail: counts.fail,
        test_pass_rate: counts.pass_rate(),
        target_pass_rate: agent.spec.target_pass_rate,
        summary,
        written_at: Utc::now(),
    }
}

fn finish_meta(
    paths: &CyclePaths,
    meta: &mut CycleMeta,
    outcome: CycleEnd,
    started: Instant,
) -> Result<()> {
    meta.outcome = outcome;
    meta.duration_ms = started.elapsed().as_millis() as u64;
    paths.write_meta(meta)
}

/// Records transcript findings and runs the in-flight freshness checkpoints.
struct CycleObserver<'a> {
    status: &'a StatusStore,
    resolver: &'a Resolver,
    deps: &'a [Dependency],
    anchor: SystemTime,
    stale: Option<Vec<String>>,
}

impl WorkerObserver for CycleObserver<'_> {
    fn on_line(&mut self, line: &str) {
        let Some(finding) = scan_line(line) else {
            return;
        };
        // Scraping is best-effort; a failed write never stops the worker.
        if let Err(err) = self.status.update(|s| {
            s.apply_finding(&finding);
        }) {
            warn!("failed to record transcript finding: {err:#}");
        }
    }

    fn on_checkpoint(&mut self, index: usize) -> Result<ControlFlow<()>> {
        match self.resolver.check_freshness(self.deps, self.anchor)? {
            Freshness::Current => Ok(ControlFlow::Continue(())),
            Freshness::Stale { updated } => {
                info!(checkpoint = index + 1, updated = ?updated, "dependency changed during worker");
                self.stale = Some(updated);
                Ok(ControlFlow::Break(()))
            }
        }
    }
}
