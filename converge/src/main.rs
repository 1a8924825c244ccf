//! `converge`: per-agent convergence controller.
//!
//! Runs one lifecycle cycle per process by default and exits so the hosting
//! runtime can restart it; `loop` runs cycles in-process instead. Once the
//! agent settles the process stays in maintenance, refreshing its heartbeat.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use converge::core::metrics::SummaryParser;
use converge::core::spec::{
    AgentSpec, DEFAULT_MAX_CYCLES, DEFAULT_TARGET_PASS_RATE, WorkspaceStrategy,
    parse_dependencies, validate_agent_name,
};
use converge::core::types::LifecycleStatus;
use converge::cycle::{Agent, AgentRecords, CycleOutcome, run_cycle};
use converge::exit_codes;
use converge::io::config::{ControllerConfig, load_config};
use converge::io::heartbeat::Heartbeat;
use converge::io::layout::{DEFAULT_STATE_DIR, StateLayout};
use converge::io::resolver::DependencyTimeoutError;
use converge::io::test_runner::ShellTestRunner;
use converge::io::worker::CommandWorker;
use converge::looping::run_loop;
use converge::logging;
use converge::maintenance::run_maintenance;
use converge::reset::fresh_start;

#[derive(Parser, Debug)]
#[command(
    name = "converge",
    version,
    about = "Per-agent convergence controller"
)]
struct Cli {
    /// Agent name.
    #[arg(long, env = "AGENT_NAME", global = true)]
    agent: Option<String>,

    /// Comma-separated names of agents this one depends on.
    #[arg(long, env = "AGENT_DEPENDS_ON", global = true)]
    depends_on: Option<String>,

    /// Shell command that runs the test suite.
    #[arg(long, env = "AGENT_TEST_COMMAND", global = true)]
    test_command: Option<String>,

    #[arg(long, env = "AGENT_MAX_CYCLES", default_value_t = DEFAULT_MAX_CYCLES, global = true)]
    max_cycles: u32,

    /// Pass-rate percentage that counts as converged.
    #[arg(long, env = "AGENT_TARGET_PASS_RATE", default_value_t = DEFAULT_TARGET_PASS_RATE, global = true)]
    target_pass_rate: u32,

    /// Minimum number of tests that must run before convergence counts.
    #[arg(long, env = "AGENT_MIN_TOTAL_TESTS", default_value_t = 0, global = true)]
    min_total_tests: u32,

    /// `isolated`, `layer` or `unified`; derived from the agent name when unset.
    #[arg(long, env = "AGENT_WORKSPACE_STRATEGY", global = true)]
    workspace_strategy: Option<String>,

    /// Reset the cycle counter and start marker before running.
    #[arg(long, env = "AGENT_FRESH_START", global = true)]
    fresh_start: bool,

    /// Read-only analysis mode for the worker.
    #[arg(long, env = "AGENT_DEBUG", global = true)]
    debug: bool,

    /// Shared state root.
    #[arg(long, env = "CONVERGE_STATE_DIR", default_value = DEFAULT_STATE_DIR, global = true)]
    state_dir: PathBuf,

    /// Config file; defaults to `<state-dir>/converge.toml`.
    #[arg(long, env = "CONVERGE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Debug-level tracing when `RUST_LOG` is unset.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Run one cycle and exit (default).
    Run,
    /// Run cycles in-process until the agent settles.
    Loop,
    /// Zero the cycle counter and remove the start marker.
    Reset,
    /// Print the agent's status record.
    Status,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() {
                exit_codes::INVALID
            } else {
                exit_codes::OK
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    logging::init(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            if let Some(timeout) = err.downcast_ref::<DependencyTimeoutError>() {
                error!(pending = ?timeout.pending, waited_secs = timeout.waited.as_secs(), "dependency wait timed out");
            }
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    let layout = StateLayout::new(&cli.state_dir);
    let config_path = cli.config.clone().unwrap_or_else(|| layout.config_path());
    let config = load_config(&config_path)?;
    let name = cli
        .agent
        .clone()
        .context("missing agent name (--agent or AGENT_NAME)")?;
    validate_agent_name(&name)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Status => cmd_status(&layout, &name),
        Command::Reset => cmd_reset(&layout, &name),
        Command::Run => cmd_run(&cli, name, config, layout, false),
        Command::Loop => cmd_run(&cli, name, config, layout, true),
    }
}

fn cmd_status(layout: &StateLayout, name: &str) -> Result<i32> {
    let records = AgentRecords::open(layout, name);
    let status = records
        .status
        .load()?
        .with_context(|| format!("no status record for agent {name}"))?;
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("serialize status")?
    );
    Ok(exit_codes::OK)
}

fn cmd_reset(layout: &StateLayout, name: &str) -> Result<i32> {
    let records = AgentRecords::open(layout, name);
    let outcome = fresh_start(&records)?;
    println!(
        "{name}: counter {} -> 0{}",
        outcome.previous_counter,
        if outcome.marker_removed {
            ", start marker removed"
        } else {
            ""
        }
    );
    Ok(exit_codes::OK)
}

fn cmd_run(
    cli: &Cli,
    name: String,
    config: ControllerConfig,
    layout: StateLayout,
    in_process: bool,
) -> Result<i32> {
    let spec = build_spec(cli, name)?;
    let agent = Agent::new(spec, config, layout)?;
    let records = &agent.records;

    if cli.fresh_start {
        fresh_start(records)?;
    }
    records.status.ensure()?;
    install_termination_handler(records)?;

    let tests = ShellTestRunner::with_parser(SummaryParser::with_patterns(
        &agent.config.tests.pass_patterns,
        &agent.config.tests.fail_patterns,
    )?);
    let worker = CommandWorker::new(agent.config.worker.command.clone());
    let heartbeat = Heartbeat::start(
        records.status.clone(),
        Duration::from_secs(agent.config.heartbeat.interval_secs),
    );

    let settled = if in_process {
        let outcome = run_loop(&agent, &tests, &worker, |cycle| {
            info!(outcome = ?cycle, "cycle finished");
        })?;
        Some(outcome.settlement)
    } else {
        match run_cycle(&agent, &tests, &worker)? {
            CycleOutcome::Settled(settlement) => Some(settlement),
            outcome @ (CycleOutcome::Completed { .. } | CycleOutcome::Restart { .. }) => {
                info!(outcome = ?outcome, "exiting for restart");
                None
            }
        }
    };
    drop(heartbeat);

    if let Some(settlement) = settled {
        info!(outcome = ?settlement.outcome, cycle = settlement.cycle, resumed = settlement.resumed, "agent settled");
        run_maintenance(
            &records.status,
            Duration::from_secs(agent.config.heartbeat.maintenance_interval_secs),
            None,
        );
    }
    Ok(exit_codes::OK)
}

fn build_spec(cli: &Cli, name: String) -> Result<AgentSpec> {
    let test_command = cli
        .test_command
        .clone()
        .filter(|c| !c.trim().is_empty())
        .context("missing test command (--test-command or AGENT_TEST_COMMAND)")?;
    let mut spec = AgentSpec::new(name, test_command);
    if let Some(raw) = &cli.depends_on {
        spec.depends_on = parse_dependencies(raw);
    }
    if let Some(strategy) = &cli.workspace_strategy {
        spec.workspace = WorkspaceStrategy::parse(strategy, &spec.name)?;
    }
    spec.max_cycles = cli.max_cycles;
    spec.target_pass_rate = cli.target_pass_rate;
    spec.min_total_tests = cli.min_total_tests;
    spec.debug = cli.debug;
    spec.validate()?;
    Ok(spec)
}

/// On SIGINT/SIGTERM: mark the agent stopped (unless it already completed) and exit 130.
fn install_termination_handler(records: &AgentRecords) -> Result<()> {
    let status = records.status.clone();
    let progress = records.progress.clone();
    ctrlc::set_handler(move || {
        let result = status.update(|s| {
            if s.status != LifecycleStatus::Completed {
                s.status = LifecycleStatus::Stopped;
                s.reason = Some("terminated by signal".to_string());
            }
        });
        if let Err(err) = result {
            warn!("failed to record termination: {err:#}");
        }
        if let Err(err) = progress.append("terminated by signal") {
            warn!("failed to append progress: {err:#}");
        }
        std::process::exit(exit_codes::TERMINATED);
    })
    .context("install termination handler")
}
