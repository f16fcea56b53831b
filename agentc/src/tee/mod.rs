//! Isolation boundary ("trusted execution environment") for plugin interpreters.
//!
//! Three levels share one contract, [`Tee`]: a plain supervised process with
//! OS resource limits, a container, and a container on a VM-backed OCI
//! runtime. [`create_tee`] is the only place that picks an implementation.
//!
//! Every `execute` on one instance holds that instance's [`ExecSlot`], so
//! concurrent callers queue instead of interleaving.

use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;

use crate::core::cancel::CancelToken;
use crate::core::spec::{IsolationLevel, ResourceLimits, TeeSpec};
use crate::error::{Error, Resource, Result};
use crate::io::config::TeeConfig;
use crate::io::process::CommandOutput;

pub mod container;
pub mod process;
pub mod vm;

pub use container::ContainerTee;
pub use process::ProcessTee;
pub use vm::VmTee;

/// File the long-lived interpreter's output is written to, inside the boundary.
pub const INTERPRETER_LOG: &str = "interpreter.log";

/// One command to run to completion inside the boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    /// Overrides the wall-clock limit for this call only.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Result of a command that ran to completion. A non-zero exit is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Shared contract of every isolation level.
pub trait Tee: Send + Sync {
    fn level(&self) -> IsolationLevel;

    /// Create the boundary. Calling it on a running instance is a no-op.
    fn start(&mut self) -> Result<()>;

    /// Kill the interpreter and release the boundary. Idempotent.
    fn stop(&mut self) -> Result<()>;

    /// Run a command to completion under the instance's limits.
    ///
    /// Limit violations surface as [`Error::ResourceExceeded`]; cancellation
    /// kills the command and returns [`Error::Cancelled`].
    fn execute(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecOutput>;

    /// Start the single long-lived interpreter. Its output goes to [`INTERPRETER_LOG`].
    fn launch(&mut self, program: &str, args: &[String]) -> Result<()>;

    /// True while a launched interpreter has not exited.
    fn interpreter_alive(&mut self) -> bool;

    /// Copy a host file to `rel` inside the boundary's working directory.
    fn copy_file_in(&self, host: &Path, rel: &Path) -> Result<()>;

    /// Copy `rel` from the boundary's working directory to a host path.
    fn copy_file_out(&self, rel: &Path, host: &Path) -> Result<()>;

    /// Working directory as seen from inside the boundary, once started.
    fn workdir(&self) -> Option<&Path>;

    fn is_running(&self) -> bool;
}

/// Build (but do not start) the boundary for `spec.isolation`.
pub fn create_tee(spec: &TeeSpec, cfg: &TeeConfig) -> Box<dyn Tee> {
    match spec.isolation {
        IsolationLevel::Process => Box::new(ProcessTee::new(spec.clone(), cfg.clone())),
        IsolationLevel::Container => Box::new(ContainerTee::new(spec.clone(), cfg.clone())),
        IsolationLevel::Vm => Box::new(VmTee::new(spec.clone(), cfg.clone())),
    }
}

/// Single execution slot of one instance.
#[derive(Debug, Default)]
pub(crate) struct ExecSlot(Mutex<()>);

impl ExecSlot {
    /// Block until no other `execute` holds the slot.
    pub(crate) fn acquire(&self) -> MutexGuard<'_, ()> {
        // A panicked holder leaves nothing half-written behind the unit value.
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Validate a path inside the boundary: relative, no `..`, not empty.
pub(crate) fn confined(rel: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Isolation(anyhow!(
                    "path {} escapes the working directory",
                    rel.display()
                )));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(Error::Isolation(anyhow!("empty path inside the boundary")));
    }
    Ok(clean)
}

/// Map a finished command to the limit it ran into, if any.
pub(crate) fn classify(
    output: &CommandOutput,
    limits: &ResourceLimits,
    timeout: Duration,
) -> Option<Error> {
    let stderr = output.stderr_lossy();
    let exceeded = |resource, limit: String| Error::ResourceExceeded {
        resource,
        limit,
        stderr: stderr.clone(),
    };
    if output.timed_out {
        return Some(exceeded(
            Resource::WallClock,
            format!("{}s", timeout.as_secs_f64()),
        ));
    }
    if killed_by_cpu_limit(output) {
        return Some(exceeded(
            Resource::Cpu,
            format!("{} cpu-seconds", limits.cpu_seconds()),
        ));
    }
    if output.status.code() != Some(0) && reports_out_of_memory(&stderr) {
        return Some(exceeded(Resource::Memory, format!("{} MB", limits.memory_mb)));
    }
    None
}

pub(crate) fn reports_out_of_memory(stderr: &str) -> bool {
    ["MemoryError", "Cannot allocate memory", "std::bad_alloc", "out of memory"]
        .iter()
        .any(|needle| stderr.contains(needle))
}

#[cfg(unix)]
fn killed_by_cpu_limit(output: &CommandOutput) -> bool {
    use std::os::unix::process::ExitStatusExt;
    // SIGXCPU is 24 on Linux and macOS.
    output.status.signal() == Some(24)
}

#[cfg(not(unix))]
fn killed_by_cpu_limit(_output: &CommandOutput) -> bool {
    false
}

pub(crate) fn exec_output(output: CommandOutput) -> ExecOutput {
    ExecOutput {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.status.code(),
        elapsed: output.elapsed,
    }
}
