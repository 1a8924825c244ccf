//! Worker abstraction for the external code-generation process.
//!
//! The [`Worker`] trait decouples the lifecycle controller from the actual
//! worker backend. Tests use scripted workers that emit predetermined
//! transcript lines without spawning processes.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::process::{StreamEvent, StreamOptions, stream_command};

/// Parameters for one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub agent: String,
    pub cycle: u32,
    pub workdir: PathBuf,
    /// Rendered context bundle, fed on stdin.
    pub bundle: String,
    pub read_only: bool,
    /// Where the streamed transcript is written.
    pub transcript_path: PathBuf,
    pub timeout: Option<Duration>,
    /// Elapsed offsets at which the observer's checkpoint hook runs.
    pub checkpoints: Vec<Duration>,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// The worker exited on its own (or hit its timeout).
    Finished {
        exit_code: Option<i32>,
        timed_out: bool,
    },
    /// The observer stopped the worker at this checkpoint index.
    Interrupted { checkpoint: usize },
}

/// Callbacks the controller receives while the worker runs.
pub trait WorkerObserver {
    /// One transcript line.
    fn on_line(&mut self, line: &str);
    /// A configured checkpoint elapsed. `Break` stops the worker.
    fn on_checkpoint(&mut self, index: usize) -> Result<ControlFlow<()>>;
}

pub trait Worker {
    fn invoke(
        &self,
        request: &WorkerRequest,
        observer: &mut dyn WorkerObserver,
    ) -> Result<WorkerOutcome>;
}

/// Worker that spawns a configured command with the bundle on stdin.
pub struct CommandWorker {
    command: Vec<String>,
}

impl CommandWorker {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Worker for CommandWorker {
    #[instrument(skip_all, fields(agent = %request.agent, cycle = request.cycle))]
    fn invoke(
        &self,
        request: &WorkerRequest,
        observer: &mut dyn WorkerObserver,
    ) -> Result<WorkerOutcome> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("worker command is empty"))?;
        info!(workdir = %request.workdir.display(), program = %program, "starting worker");

        fs::create_dir_all(&request.workdir)
            .with_context(|| format!("create workdir {}", request.workdir.display()))?;
        if let Some(parent) = request.transcript_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create transcript dir {}", parent.display()))?;
        }
        let file = File::create(&request.transcript_path).with_context(|| {
            format!("create transcript {}", request.transcript_path.display())
        })?;
        let mut transcript = BufWriter::new(file);

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&request.workdir)
            .env("CONVERGE_AGENT", &request.agent)
            .env("CONVERGE_CYCLE", request.cycle.to_string())
            .env("CONVERGE_READ_ONLY", if request.read_only { "1" } else { "0" });

        let options = StreamOptions {
            timeout: request.timeout,
            checkpoints: request.checkpoints.clone(),
            output_limit_bytes: request.output_limit_bytes,
            ..StreamOptions::default()
        };
        let mut stopped_at = None;
        let output = stream_command(
            cmd,
            Some(request.bundle.clone().into_bytes()),
            &options,
            |event| match event {
                StreamEvent::Line(line) => {
                    // Flush per line so operators can tail the transcript.
                    if let Err(err) =
                        writeln!(transcript, "{line}").and_then(|()| transcript.flush())
                    {
                        warn!(err = %err, "failed to write worker transcript");
                    }
                    observer.on_line(line);
                    Ok(ControlFlow::Continue(()))
                }
                StreamEvent::Checkpoint(index) => {
                    let flow = observer.on_checkpoint(index)?;
                    if flow.is_break() {
                        stopped_at = Some(index);
                    }
                    Ok(flow)
                }
            },
        )
        .context("run worker")?;
        transcript.flush().context("flush worker transcript")?;

        if let Some(checkpoint) = stopped_at {
            info!(checkpoint, "worker interrupted");
            return Ok(WorkerOutcome::Interrupted { checkpoint });
        }
        if output.timed_out {
            warn!("worker timed out");
        } else if !output.status.success() {
            warn!(exit_code = ?output.exit_code(), "worker exited unsuccessfully");
        }
        Ok(WorkerOutcome::Finished {
            exit_code: output.exit_code(),
            timed_out: output.timed_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        lines: Vec<String>,
        stop_at: Option<usize>,
        checkpoints: Vec<usize>,
    }

    impl WorkerObserver for Recorder {
        fn on_line(&mut self, line: &str) {
            self.lines.push(line.to_string());
        }

        fn on_checkpoint(&mut self, index: usize) -> Result<ControlFlow<()>> {
            self.checkpoints.push(index);
            if self.stop_at == Some(index) {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        }
    }

    fn request(dir: &std::path::Path) -> WorkerRequest {
        WorkerRequest {
            agent: "api".to_string(),
            cycle: 2,
            workdir: dir.join("work"),
            bundle: "context bundle\n".to_string(),
            read_only: true,
            transcript_path: dir.join("cycles/2/worker.log"),
            timeout: None,
            checkpoints: Vec::new(),
            output_limit_bytes: 10_000,
        }
    }

    fn sh(script: &str) -> CommandWorker {
        CommandWorker::new(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[test]
    fn passes_bundle_and_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let req = request(temp.path());
        let mut recorder = Recorder::default();

        let outcome = sh("cat; echo \"$CONVERGE_AGENT $CONVERGE_CYCLE $CONVERGE_READ_ONLY\"")
            .invoke(&req, &mut recorder)
            .expect("invoke");

        assert_eq!(
            outcome,
            WorkerOutcome::Finished {
                exit_code: Some(0),
                timed_out: false
            }
        );
        assert_eq!(recorder.lines, vec!["context bundle", "api 2 1"]);
        let transcript = fs::read_to_string(&req.transcript_path).expect("transcript");
        assert!(transcript.contains("api 2 1"));
    }

    #[test]
    fn nonzero_exit_is_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let outcome = sh("exit 4")
            .invoke(&request(temp.path()), &mut Recorder::default())
            .expect("invoke");
        assert_eq!(
            outcome,
            WorkerOutcome::Finished {
                exit_code: Some(4),
                timed_out: false
            }
        );
    }

    #[test]
    fn checkpoint_can_stop_worker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut req = request(temp.path());
        req.checkpoints = vec![Duration::from_millis(20), Duration::from_millis(40)];
        let mut recorder = Recorder {
            stop_at: Some(1),
            ..Recorder::default()
        };

        let outcome = sh("exec sleep 30").invoke(&req, &mut recorder).expect("invoke");
        assert_eq!(outcome, WorkerOutcome::Interrupted { checkpoint: 1 });
        assert_eq!(recorder.checkpoints, vec![0, 1]);
    }

    #[test]
    fn missing_program_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let worker = CommandWorker::new(vec!["/nonexistent/converge-worker".to_string()]);
        let err = worker
            .invoke(&request(temp.path()), &mut Recorder::default())
            .unwrap_err();
        assert!(format!("{err:#}").contains("spawn command"));
    }
}
