//! Helpers for running child processes with deadlines, cancellation, and bounded output.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::core::cancel::CancelToken;

/// Granularity at which a running child is checked for cancellation.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of child output, forwarded as it is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// How a supervised command is fed, bounded, and observed.
#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    /// Bytes of stdout/stderr kept in memory each; the rest is drained and counted.
    pub output_limit_bytes: usize,
    pub cancel: Option<&'a CancelToken>,
    /// Receives every output line while the child runs.
    pub lines: Option<Sender<OutputLine>>,
}

impl<'a> RunOptions<'a> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            cancel: None,
            lines: None,
        }
    }

    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn lines(mut self, sender: Sender<OutputLine>) -> Self {
        self.lines = Some(sender);
        self
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
pub fn run_command_with_timeout(
    cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    let mut opts = RunOptions::new(timeout, output_limit_bytes);
    opts.stdin = stdin;
    run_supervised(cmd, opts)
}

/// Run a command to completion under a deadline and an optional cancel token.
///
/// Output is read concurrently while the child runs. The child is placed in
/// its own process group on Unix so that a kill on timeout or cancellation
/// also reaches anything it spawned. Descendants that keep the output pipes
/// open after the child exits are held to the same deadline. A timed-out or
/// cancelled run still returns `Ok` with the corresponding flag set; callers
/// decide what it means.
#[instrument(skip_all, fields(timeout_secs = opts.timeout.as_secs(), output_limit_bytes = opts.output_limit_bytes))]
pub fn run_supervised(mut cmd: Command, opts: RunOptions<'_>) -> Result<CommandOutput> {
    if opts.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!("spawning child process");
    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };
    let pid = child.id();

    let stdin_handle = match opts.stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // A child that exits without reading closes the pipe; that is not our error.
            Some(thread::spawn(move || {
                let _ = child_stdin.write_all(&input);
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = opts.output_limit_bytes;
    let stdout_lines = opts.lines.clone();
    let stderr_lines = opts.lines;
    let stdout_handle = thread::spawn(move || {
        read_lines_limited(stdout, limit, OutputStream::Stdout, stdout_lines)
    });
    let stderr_handle = thread::spawn(move || {
        read_lines_limited(stderr, limit, OutputStream::Stderr, stderr_lines)
    });

    let deadline = started + opts.timeout;
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let now = Instant::now();
        let slice = deadline.saturating_duration_since(now).min(POLL_SLICE);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if opts.cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, killing");
            cancelled = true;
        } else if Instant::now() >= deadline {
            warn!(
                timeout_secs = opts.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
        } else {
            continue;
        }
        kill_tree(&mut child).context("kill command")?;
        break child.wait().context("wait command after kill")?;
    };

    if !timed_out && !cancelled {
        while !(stdout_handle.is_finished() && stderr_handle.is_finished()) {
            if opts.cancel.is_some_and(CancelToken::is_cancelled) {
                cancelled = true;
            } else if Instant::now() >= deadline {
                timed_out = true;
            } else {
                let slice = deadline.saturating_duration_since(Instant::now()).min(POLL_SLICE);
                thread::sleep(slice);
                continue;
            }
            warn!(timed_out, cancelled, "descendants kept output open after exit, killing group");
            kill_group(pid);
            break;
        }
    }
    let elapsed = started.elapsed();

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if let Some(handle) = stdin_handle {
        let _ = handle.join();
    }

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, elapsed_ms = elapsed.as_millis() as u64, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
        elapsed,
    })
}

/// Spawn a long-lived child whose stdout and stderr are appended to `log_path`.
#[instrument(skip_all, fields(log = %log_path.display()))]
pub fn spawn_logged(mut cmd: Command, log_path: &Path) -> Result<Child> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let log = File::create(log_path)
        .with_context(|| format!("create log file {}", log_path.display()))?;
    let log_err = log.try_clone().context("clone log handle")?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    isolate_process_group(&mut cmd);
    let child = cmd.spawn().context("spawn long-lived command")?;
    debug!(pid = child.id(), "spawned long-lived child");
    Ok(child)
}

/// Kill a child and, on Unix, the process group it leads.
pub fn kill_tree(child: &mut Child) -> std::io::Result<()> {
    if !kill_group(child.id()) {
        debug!("process group kill unavailable, killing child only");
    }
    match child.kill() {
        Ok(()) => Ok(()),
        // Already reaped by the group kill.
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e),
    }
}

/// SIGKILL the process group led by `pid`. Returns whether a signal was delivered.
#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    let group = format!("-{pid}");
    let status = Command::new("kill")
        .args(["-s", "KILL", "--", &group])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    matches!(status, Ok(s) if s.success())
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn isolate_process_group(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate_process_group(_cmd: &mut Command) {}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream line by line with a size limit, forwarding each line if asked.
fn read_lines_limited<R: Read>(
    reader: R,
    limit: usize,
    stream: OutputStream,
    lines: Option<Sender<OutputLine>>,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(sender) = &lines {
            let text = String::from_utf8_lossy(&line)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            // A dropped receiver only stops progress reporting.
            let _ = sender.send(OutputLine { stream, line: text });
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}
