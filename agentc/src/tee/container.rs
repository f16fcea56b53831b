//! Container isolation through the `docker` or `podman` CLI.
//!
//! One long-lived container per instance (`sleep infinity`), created with
//! memory and CPU ceilings, all capabilities dropped, and no networking unless
//! the plugin allows it. When filesystem access is denied the root filesystem is
//! read-only and only the `/work` volume and a `/tmp` tmpfs are writable.
//! Commands run through `<engine> exec` wrapped in `timeout -s KILL`, so the
//! in-container process dies even if the host-side client is killed first.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use rand::{Rng, distributions::Alphanumeric};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::spec::{IsolationLevel, TeeSpec};
use crate::error::{Error, Resource, Result, Stage};
use crate::io::config::TeeConfig;
use crate::io::process::{CommandOutput, RunOptions, run_command_with_timeout, run_supervised};
use crate::tee::{
    ExecOutput, ExecRequest, ExecSlot, INTERPRETER_LOG, Tee, classify, confined, exec_output,
};

/// Working directory inside the container.
pub const CONTAINER_WORKDIR: &str = "/work";

/// Pid file written by the launched interpreter's shell before it execs.
const INTERPRETER_PID: &str = ".interpreter.pid";

/// Host-side slack on top of the in-container `timeout`.
const EXEC_GRACE: Duration = Duration::from_secs(5);

/// Prints the container cgroup's OOM event counters (v2 first, then v1).
const OOM_EVENTS_SCRIPT: &str =
    "cat /sys/fs/cgroup/memory.events /sys/fs/cgroup/memory/memory.oom_control 2>/dev/null; true";

/// Supported container engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerEngine {
    Docker,
    Podman,
}

impl ContainerEngine {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "docker" => Some(Self::Docker),
            "podman" => Some(Self::Podman),
            _ => None,
        }
    }

    /// Binary name for this engine.
    pub fn binary(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::Podman => "podman",
        }
    }
}

/// Characters allowed in image and runtime names (alphanumeric, `-`, `_`, `.`, `/`, `:`, `@`).
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@'))
}

#[derive(Debug)]
pub struct ContainerTee {
    level: IsolationLevel,
    spec: TeeSpec,
    cfg: TeeConfig,
    engine: ContainerEngine,
    /// OCI runtime passed as `--runtime`; `None` uses the engine default.
    oci_runtime: Option<String>,
    name: Option<String>,
    interpreter_launched: bool,
    /// `oom_kill` count last seen in the container's cgroup.
    oom_kills: AtomicU64,
    slot: ExecSlot,
}

impl ContainerTee {
    pub fn new(spec: TeeSpec, cfg: TeeConfig) -> Self {
        Self::with_runtime(IsolationLevel::Container, spec, cfg, None)
    }

    /// Container bound to a specific OCI runtime, reported as `level`.
    pub fn with_runtime(
        level: IsolationLevel,
        spec: TeeSpec,
        cfg: TeeConfig,
        oci_runtime: Option<String>,
    ) -> Self {
        let engine = ContainerEngine::parse(&cfg.container_runtime).unwrap_or_else(|| {
            warn!(engine = %cfg.container_runtime, "unknown container engine, using docker");
            ContainerEngine::Docker
        });
        Self {
            level,
            spec,
            cfg,
            engine,
            oci_runtime,
            name: None,
            interpreter_launched: false,
            oom_kills: AtomicU64::new(0),
            slot: ExecSlot::default(),
        }
    }

    pub fn engine(&self) -> ContainerEngine {
        self.engine
    }

    pub fn image(&self) -> &str {
        &self.cfg.container_image
    }

    /// Run an engine management command; non-zero exit is an error carrying stderr.
    pub(crate) fn manage(&self, args: &[String]) -> anyhow::Result<CommandOutput> {
        let mut cmd = Command::new(self.engine.binary());
        cmd.args(args);
        debug!(command = %format_command(self.engine.binary(), args), "container management");
        let output = run_command_with_timeout(
            cmd,
            None,
            Duration::from_secs(self.cfg.management_timeout_secs),
            self.cfg.output_limit_bytes,
        )
        .with_context(|| format!("run {}", self.engine.binary()))?;
        if output.timed_out {
            return Err(anyhow!(
                "{} timed out after {}s",
                format_command(self.engine.binary(), args),
                self.cfg.management_timeout_secs
            ));
        }
        if !output.status.success() {
            return Err(anyhow!(
                "{} failed ({:?}): {}",
                format_command(self.engine.binary(), args),
                output.status.code(),
                output.stderr_lossy().trim()
            ));
        }
        Ok(output)
    }

    fn running_name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| Error::Isolation(anyhow!("{} boundary is not started", self.level)))
    }

    fn container_path(rel: &Path) -> Result<String> {
        let rel = confined(rel)?;
        let joined = Path::new(CONTAINER_WORKDIR).join(rel);
        Ok(joined.to_string_lossy().into_owned())
    }

    /// Cumulative OOM kills in the container's memory cgroup, if readable.
    fn oom_kill_count(&self, name: &str) -> Option<u64> {
        match self.manage(&strings(["exec", name, "sh", "-c", OOM_EVENTS_SCRIPT])) {
            Ok(output) => parse_oom_kills(&output.stdout_lossy()),
            Err(err) => {
                debug!(err = %err, "cannot read container oom counters");
                None
            }
        }
    }

    /// Whether the cgroup recorded an OOM kill since the last check.
    fn oom_killed_since_last_check(&self, name: &str) -> bool {
        let Some(count) = self.oom_kill_count(name) else {
            return false;
        };
        let previous = self.oom_kills.fetch_max(count, Ordering::SeqCst);
        count > previous
    }

    fn remove(&mut self) -> Result<()> {
        if let Some(name) = self.name.take() {
            self.interpreter_launched = false;
            self.manage(&strings(["rm", "-f", "-v", name.as_str()]))
                .map_err(Error::Isolation)?;
            info!(container = %name, "container removed");
        }
        Ok(())
    }
}

impl Tee for ContainerTee {
    fn level(&self) -> IsolationLevel {
        self.level
    }

    #[instrument(skip_all, fields(level = %self.level))]
    fn start(&mut self) -> Result<()> {
        if self.name.is_some() {
            return Ok(());
        }
        let start_error = |message: String| Error::TeeStart {
            level: self.level,
            message,
        };
        if !is_valid_name(&self.cfg.container_image) {
            return Err(start_error(format!(
                "invalid container image name {:?}",
                self.cfg.container_image
            )));
        }
        if let Some(runtime) = &self.oci_runtime
            && !is_valid_name(runtime)
        {
            return Err(start_error(format!("invalid OCI runtime name {runtime:?}")));
        }
        let name = format!("agentc-{}", short_id());
        let args = run_args(
            &name,
            &self.spec,
            &self.cfg.container_image,
            self.oci_runtime.as_deref(),
        );
        self.manage(&args).map_err(|e| start_error(format!("{e:#}")))?;
        info!(container = %name, image = %self.cfg.container_image, "container started");
        self.oom_kills
            .store(self.oom_kill_count(&name).unwrap_or(0), Ordering::SeqCst);
        self.name = Some(name);
        Ok(())
    }

    #[instrument(skip_all, fields(level = %self.level))]
    fn stop(&mut self) -> Result<()> {
        self.remove()
    }

    #[instrument(skip_all, fields(level = %self.level, program = %request.program))]
    fn execute(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecOutput> {
        let name = self.running_name()?;
        let _slot = self.slot.acquire();
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(self.spec.limits.timeout_sec));
        let args = exec_args(name, request, timeout);
        let mut cmd = Command::new(self.engine.binary());
        cmd.args(&args);
        let mut opts =
            RunOptions::new(timeout + EXEC_GRACE, self.cfg.output_limit_bytes).cancel(cancel);
        opts.stdin = request.stdin.as_deref();
        let output = run_supervised(cmd, opts)
            .with_context(|| format!("{} exec", self.engine.binary()))
            .map_err(Error::Isolation)?;
        if output.cancelled {
            return Err(Error::Cancelled {
                stage: Stage::Isolation,
            });
        }
        if let Some(err) = classify(&output, &self.spec.limits, timeout) {
            return Err(err);
        }
        let code = output.status.code();
        let oom_killed = code == Some(SIGKILL_EXIT)
            && output.elapsed < timeout
            && self.oom_killed_since_last_check(name);
        if let Some(resource) = classify_exit(code, output.elapsed, timeout, oom_killed) {
            let limit = match resource {
                Resource::WallClock => format!("{}s", timeout.as_secs_f64()),
                Resource::Memory => format!("{} MB", self.spec.limits.memory_mb),
                Resource::Cpu => format!("{} cores", self.spec.limits.cpu_cores),
            };
            return Err(Error::ResourceExceeded {
                resource,
                limit,
                stderr: output.stderr_lossy(),
            });
        }
        Ok(exec_output(output))
    }

    #[instrument(skip_all, fields(level = %self.level, program = %program))]
    fn launch(&mut self, program: &str, args: &[String]) -> Result<()> {
        if self.interpreter_alive() {
            return Err(Error::Isolation(anyhow!("an interpreter is already running")));
        }
        let name = self.running_name()?.to_string();
        let mut argv = strings(["exec", "-d", "-w", CONTAINER_WORKDIR, name.as_str(), "sh", "-c"]);
        argv.push(format!(
            "echo $$ > {CONTAINER_WORKDIR}/{INTERPRETER_PID}; exec \"$@\" >> {CONTAINER_WORKDIR}/{INTERPRETER_LOG} 2>&1"
        ));
        argv.push("sh".to_string());
        argv.push(program.to_string());
        argv.extend(args.iter().cloned());
        self.manage(&argv).map_err(Error::Isolation)?;
        self.interpreter_launched = true;
        Ok(())
    }

    fn interpreter_alive(&mut self) -> bool {
        if !self.interpreter_launched {
            return false;
        }
        let Some(name) = self.name.clone() else {
            return false;
        };
        let check = format!("kill -0 \"$(cat {CONTAINER_WORKDIR}/{INTERPRETER_PID})\"");
        let alive = self
            .manage(&strings(["exec", name.as_str(), "sh", "-c", check.as_str()]))
            .is_ok();
        if !alive {
            self.interpreter_launched = false;
        }
        alive
    }

    fn copy_file_in(&self, host: &Path, rel: &Path) -> Result<()> {
        let name = self.running_name()?;
        let target = Self::container_path(rel)?;
        if let Some(parent) = Path::new(&target).parent() {
            let parent = parent.to_string_lossy();
            self.manage(&strings(["exec", name, "mkdir", "-p", parent.as_ref()]))
                .map_err(Error::Isolation)?;
        }
        self.manage(&[
            "cp".to_string(),
            host.display().to_string(),
            format!("{name}:{target}"),
        ])
        .map_err(Error::Isolation)?;
        Ok(())
    }

    fn copy_file_out(&self, rel: &Path, host: &Path) -> Result<()> {
        let name = self.running_name()?;
        let source = Self::container_path(rel)?;
        self.manage(&[
            "cp".to_string(),
            format!("{name}:{source}"),
            host.display().to_string(),
        ])
        .map_err(Error::Isolation)?;
        Ok(())
    }

    fn workdir(&self) -> Option<&Path> {
        self.name.as_ref().map(|_| Path::new(CONTAINER_WORKDIR))
    }

    fn is_running(&self) -> bool {
        self.name.is_some()
    }
}

impl Drop for ContainerTee {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            warn!(err = %err, "failed to remove container on drop");
        }
    }
}

/// `run -d` arguments for the long-lived container.
pub(crate) fn run_args(
    name: &str,
    spec: &TeeSpec,
    image: &str,
    oci_runtime: Option<&str>,
) -> Vec<String> {
    let limits = &spec.limits;
    let mut args = strings(["run", "-d", "--name", name]);
    if !spec.network_access {
        args.extend(strings(["--network", "none"]));
    }
    args.push("--memory".to_string());
    args.push(format!("{}m", limits.memory_mb));
    args.push("--memory-swap".to_string());
    args.push(format!("{}m", limits.memory_mb));
    args.push("--cpus".to_string());
    args.push(format!("{}", limits.cpu_cores));
    args.extend(strings(["--pids-limit", "256"]));
    if !spec.filesystem_access {
        args.extend(strings([
            "--read-only",
            "--tmpfs",
            "/tmp:rw,nosuid,size=64m",
        ]));
    }
    args.extend(strings([
        "-v",
        CONTAINER_WORKDIR,
        "-w",
        CONTAINER_WORKDIR,
        "-e",
        "HOME=/work",
        "-e",
        "PYTHONUNBUFFERED=1",
        "--cap-drop",
        "ALL",
        "--security-opt",
        "no-new-privileges",
    ]));
    if let Some(runtime) = oci_runtime {
        args.push("--runtime".to_string());
        args.push(runtime.to_string());
    }
    args.extend(strings([image, "sleep", "infinity"]));
    args
}

/// `exec` arguments running one request under an in-container deadline.
pub(crate) fn exec_args(name: &str, request: &ExecRequest, timeout: Duration) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if request.stdin.is_some() {
        args.push("-i".to_string());
    }
    args.extend(strings(["-w", CONTAINER_WORKDIR, name, "timeout", "-s", "KILL"]));
    args.push(format!("{}", timeout.as_secs().max(1)));
    args.push(request.program.clone());
    args.extend(request.args.iter().cloned());
    args
}

/// Exit status of a process killed by SIGKILL, as reported through `exec`.
const SIGKILL_EXIT: i32 = 137;

/// Limit implied by an exit status that the generic classifier cannot see.
///
/// `timeout -s KILL` and the kernel OOM killer both end in SIGKILL. A kill
/// counts as the deadline only once the timeout has elapsed, and as memory
/// only when the cgroup recorded an OOM kill. Every other status, 137
/// included, is the program's own exit code.
pub(crate) fn classify_exit(
    code: Option<i32>,
    elapsed: Duration,
    timeout: Duration,
    oom_killed: bool,
) -> Option<Resource> {
    match code {
        Some(SIGKILL_EXIT) if elapsed >= timeout => Some(Resource::WallClock),
        Some(SIGKILL_EXIT) if oom_killed => Some(Resource::Memory),
        _ => None,
    }
}

/// Sum of the `oom_kill` counters in cgroup `memory.events` / `memory.oom_control` text.
pub(crate) fn parse_oom_kills(text: &str) -> Option<u64> {
    let counts: Vec<u64> = text
        .lines()
        .filter_map(|line| line.strip_prefix("oom_kill "))
        .filter_map(|value| value.trim().parse().ok())
        .collect();
    (!counts.is_empty()).then(|| counts.iter().sum())
}

fn format_command(binary: &str, args: &[String]) -> String {
    let mut parts = vec![binary.to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

fn strings<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

pub(crate) fn short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(8)
        .collect::<String>()
        .to_lowercase()
}
