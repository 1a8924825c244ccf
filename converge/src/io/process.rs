//! Helpers for running child processes with optional timeouts and bounded output.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::ops::ControlFlow;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Stdout followed by stderr, lossily decoded, with truncation notices.
    pub fn combined(&self, label: &str) -> String {
        let mut buf = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if !self.stderr.is_empty() && !buf.is_empty() && !buf.ends_with('\n') {
            buf.push('\n');
        }
        buf.push_str(&String::from_utf8_lossy(&self.stderr));
        if self.stderr_truncated > 0 {
            buf.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        if self.timed_out {
            buf.push_str(&format!("\n[{label} timed out]\n"));
        }
        buf
    }
}

/// Run a command and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// With `timeout: None` the child runs until it exits on its own.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), output_limit_bytes))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Option<Duration>,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut child = spawn_piped(&mut cmd, stdin.is_some())?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    let mut timed_out = false;
    let status = match timeout {
        None => child.wait().context("wait for command")?,
        Some(limit) => match child.wait_timeout(limit).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Options for [`stream_command`].
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub timeout: Option<Duration>,
    /// Elapsed offsets at which [`StreamEvent::Checkpoint`] fires, ascending.
    pub checkpoints: Vec<Duration>,
    pub output_limit_bytes: usize,
    /// Upper bound on how long the loop blocks between checks.
    pub poll_interval: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            checkpoints: Vec::new(),
            output_limit_bytes: 1_000_000,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Something the caller gets to react to while the child runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent<'a> {
    /// One line of stdout or stderr, without its terminator.
    Line(&'a str),
    /// The checkpoint at this index in [`StreamOptions::checkpoints`] was reached.
    Checkpoint(usize),
}

/// Result of a streamed run.
#[derive(Debug)]
pub struct StreamOutput {
    pub status: ExitStatus,
    pub transcript: Vec<u8>,
    pub truncated: usize,
    pub timed_out: bool,
    /// The event handler asked to stop the child.
    pub interrupted: bool,
}

impl StreamOutput {
    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Run a command, handing each output line and each elapsed checkpoint to `on_event`.
///
/// Returning `ControlFlow::Break` from the handler kills the child. Stdout and stderr are
/// interleaved in arrival order; at most `output_limit_bytes` of it is kept in memory.
#[instrument(skip_all, fields(checkpoints = options.checkpoints.len(), timeout_secs = options.timeout.map(|t| t.as_secs())))]
pub fn stream_command<F>(
    mut cmd: Command,
    stdin: Option<Vec<u8>>,
    options: &StreamOptions,
    mut on_event: F,
) -> Result<StreamOutput>
where
    F: FnMut(StreamEvent<'_>) -> Result<ControlFlow<()>>,
{
    let mut child = spawn_piped(&mut cmd, stdin.is_some())?;

    if let Some(input) = stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        thread::spawn(move || {
            if let Err(err) = child_stdin.write_all(&input)
                && err.kind() != ErrorKind::BrokenPipe
            {
                warn!(err = %err, "failed to write child stdin");
            }
        });
    }

    let (tx, rx) = mpsc::channel::<String>();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    spawn_line_reader(stdout, tx.clone());
    spawn_line_reader(stderr, tx);

    let started = Instant::now();
    let mut next_checkpoint = 0usize;
    let mut readers_done = false;
    let mut transcript = Vec::new();
    let mut truncated = 0usize;
    let mut timed_out = false;
    let mut interrupted = false;
    let mut status = None;
    let mut handler_error = None;

    loop {
        let elapsed = started.elapsed();
        if let Some(offset) = options.checkpoints.get(next_checkpoint)
            && elapsed >= *offset
        {
            let index = next_checkpoint;
            next_checkpoint += 1;
            debug!(index, elapsed_secs = elapsed.as_secs(), "stream checkpoint reached");
            match on_event(StreamEvent::Checkpoint(index)) {
                Ok(flow) if flow.is_break() => {
                    interrupted = true;
                    break;
                }
                Ok(_) => continue,
                Err(err) => {
                    handler_error = Some(err);
                    break;
                }
            }
        }
        if let Some(limit) = options.timeout
            && elapsed >= limit
        {
            warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
            timed_out = true;
            break;
        }

        let wait = next_wait(options, next_checkpoint, elapsed);
        if readers_done {
            if let Some(exit) = child.wait_timeout(wait).context("wait for command")? {
                status = Some(exit);
                break;
            }
            continue;
        }
        match rx.recv_timeout(wait) {
            Ok(line) => {
                keep_limited(&mut transcript, &mut truncated, &line, options.output_limit_bytes);
                let text = line.trim_end_matches(['\n', '\r']);
                match on_event(StreamEvent::Line(text)) {
                    Ok(flow) if flow.is_break() => {
                        interrupted = true;
                        break;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        handler_error = Some(err);
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => readers_done = true,
        }
    }

    if let Some(err) = handler_error {
        if let Err(stop_err) = stop_child(&mut child) {
            warn!("failed to stop command after handler error: {stop_err:#}");
        }
        return Err(err);
    }
    let status = match status {
        Some(status) => status,
        None => stop_child(&mut child)?,
    };
    if truncated > 0 {
        warn!(truncated, "transcript truncated");
    }
    debug!(exit_code = ?status.code(), timed_out, interrupted, "streamed command finished");
    Ok(StreamOutput {
        status,
        transcript,
        truncated,
        timed_out,
        interrupted,
    })
}

fn spawn_piped(cmd: &mut Command, with_stdin: bool) -> Result<Child> {
    if with_stdin {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!("spawning child process");
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            Err(e).context("spawn command")
        }
    }
}

fn next_wait(options: &StreamOptions, next_checkpoint: usize, elapsed: Duration) -> Duration {
    let mut wait = options.poll_interval;
    if let Some(offset) = options.checkpoints.get(next_checkpoint) {
        wait = wait.min(offset.saturating_sub(elapsed));
    }
    if let Some(limit) = options.timeout {
        wait = wait.min(limit.saturating_sub(elapsed));
    }
    wait.max(Duration::from_millis(1))
}

/// Kill and reap. Reader threads are left to finish on their own since a
/// grandchild may still hold the pipes open.
fn stop_child(child: &mut Child) -> Result<ExitStatus> {
    if let Some(status) = child.try_wait().context("poll command")? {
        return Ok(status);
    }
    if let Err(err) = child.kill()
        && err.kind() != ErrorKind::InvalidInput
    {
        return Err(err).context("kill command");
    }
    child.wait().context("wait command after kill")
}

fn spawn_line_reader<R: Read + Send + 'static>(reader: R, tx: Sender<String>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        loop {
            let mut line = Vec::new();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(String::from_utf8_lossy(&line).into_owned()).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(err = %err, "output reader stopped");
                    break;
                }
            }
        }
    });
}

fn keep_limited(buf: &mut Vec<u8>, truncated: &mut usize, chunk: &str, limit: usize) {
    let bytes = chunk.as_bytes();
    let remaining = limit.saturating_sub(buf.len());
    let keep = bytes.len().min(remaining);
    buf.extend_from_slice(&bytes[..keep]);
    *truncated += bytes.len() - keep;
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
