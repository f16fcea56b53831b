//! Process-level isolation: a private working directory, a scrubbed
//! environment, and OS resource limits applied through wrapper commands.
//!
//! Confinement is layered from whatever the host offers:
//!
//! - `prlimit` caps address space and CPU time (Linux).
//! - `bwrap` mounts the host read-only with a private `/tmp` and only the
//!   working directory writable, and drops networking when that is denied too
//!   (Linux, when filesystem access is denied).
//! - `unshare --user --net` removes networking (Linux, when only networking
//!   is denied).
//! - `sandbox-exec` denies networking and writes outside the working
//!   directory (macOS).
//!
//! A missing mechanism is a warning, or a start failure when `tee.strict` is set.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use anyhow::{Context, anyhow};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::spec::{IsolationLevel, TeeSpec};
use crate::error::{Error, Result, Stage};
use crate::io::config::TeeConfig;
use crate::io::process::{RunOptions, kill_tree, run_command_with_timeout, run_supervised, spawn_logged};
use crate::tee::{
    ExecOutput, ExecRequest, ExecSlot, INTERPRETER_LOG, Tee, classify, confined, exec_output,
};

const MECHANISM_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Confinement wrappers found on this host at start.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Wrappers {
    prlimit: bool,
    /// Read-only host view with the working directory bound writable.
    bwrap: bool,
    unshare_net: bool,
    /// macOS sandbox profile text.
    sandbox_profile: Option<String>,
}

#[derive(Debug)]
pub struct ProcessTee {
    spec: TeeSpec,
    cfg: TeeConfig,
    workdir: Option<TempDir>,
    wrappers: Wrappers,
    interpreter: Option<Child>,
    slot: ExecSlot,
}

impl ProcessTee {
    pub fn new(spec: TeeSpec, cfg: TeeConfig) -> Self {
        Self {
            spec,
            cfg,
            workdir: None,
            wrappers: Wrappers::default(),
            interpreter: None,
            slot: ExecSlot::default(),
        }
    }

    fn root(&self) -> Result<&Path> {
        self.workdir
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| Error::Isolation(anyhow!("process boundary is not started")))
    }

    fn detect_wrappers(&self, root: &Path) -> std::result::Result<Wrappers, Vec<String>> {
        let mut wrappers = Wrappers::default();
        let mut missing = Vec::new();

        if cfg!(target_os = "linux") {
            wrappers.prlimit = mechanism_works(&["prlimit", "--version"]);
            if !wrappers.prlimit {
                missing.push("prlimit (memory and cpu limits)".to_string());
            }
            if !self.spec.filesystem_access {
                wrappers.bwrap = mechanism_works(&bwrap_check_args(root));
                if !wrappers.bwrap {
                    missing.push("bwrap (filesystem denial)".to_string());
                }
            }
            if !self.spec.network_access && !wrappers.bwrap {
                wrappers.unshare_net =
                    mechanism_works(&["unshare", "--user", "--map-root-user", "--net", "true"]);
                if !wrappers.unshare_net {
                    missing.push("unprivileged network namespace (network denial)".to_string());
                }
            }
        } else if cfg!(target_os = "macos") {
            missing.push("prlimit (memory and cpu limits)".to_string());
            let needs_profile = !self.spec.network_access || !self.spec.filesystem_access;
            if needs_profile {
                if Path::new("/usr/bin/sandbox-exec").exists() {
                    wrappers.sandbox_profile = Some(sandbox_profile(&self.spec, root));
                } else {
                    missing.push("sandbox-exec (network and filesystem denial)".to_string());
                }
            }
        } else {
            missing.push(format!(
                "no process confinement available on {}",
                std::env::consts::OS
            ));
        }

        if missing.is_empty() {
            Ok(wrappers)
        } else if self.cfg.strict {
            Err(missing)
        } else {
            for what in &missing {
                warn!(missing = %what, "process isolation running without confinement mechanism");
            }
            Ok(wrappers)
        }
    }

    /// Command for `program` with every available wrapper applied.
    ///
    /// The CPU-time cap only applies to bounded commands; the interpreter
    /// lives as long as the boundary.
    fn command(&self, root: &Path, program: &str, args: &[String], bounded: bool) -> Command {
        let limits = &self.spec.limits;
        let mut argv: Vec<String> = Vec::new();
        if self.wrappers.bwrap {
            argv.extend(bwrap_args(root, !self.spec.network_access));
        }
        if self.wrappers.unshare_net {
            argv.extend(
                ["unshare", "--user", "--map-root-user", "--net", "--"]
                    .map(String::from),
            );
        }
        if let Some(profile) = &self.wrappers.sandbox_profile {
            argv.extend(["sandbox-exec".to_string(), "-p".to_string(), profile.clone()]);
        }
        if self.wrappers.prlimit {
            argv.push("prlimit".to_string());
            argv.push(format!("--as={}", limits.memory_bytes()));
            if bounded {
                argv.push(format!("--cpu={}", limits.cpu_seconds()));
            }
            argv.push("--".to_string());
        }
        argv.push(program.to_string());
        argv.extend(args.iter().cloned());

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .current_dir(root)
            .env_clear()
            .env("HOME", root)
            .env("TMPDIR", root)
            .env("LANG", "C.UTF-8")
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1");
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd
    }

    /// Host path for `rel`, refusing anything that resolves outside the working directory.
    ///
    /// The final component must not be a symlink; copies follow links.
    fn host_path(&self, rel: &Path) -> Result<PathBuf> {
        let root = self.root()?;
        let rel = confined(rel)?;
        let path = root.join(&rel);
        if fs::symlink_metadata(&path).is_ok_and(|meta| meta.file_type().is_symlink()) {
            return Err(Error::Isolation(anyhow!(
                "path {} is a symlink inside the working directory",
                rel.display()
            )));
        }
        let anchor = match path.parent() {
            Some(parent) if parent.exists() => parent.to_path_buf(),
            _ => return Ok(path),
        };
        let canonical_root = fs::canonicalize(root)
            .with_context(|| format!("resolve {}", root.display()))
            .map_err(Error::Isolation)?;
        let canonical = fs::canonicalize(&anchor)
            .with_context(|| format!("resolve {}", anchor.display()))
            .map_err(Error::Isolation)?;
        if !canonical.starts_with(&canonical_root) {
            return Err(Error::Isolation(anyhow!(
                "path {} resolves outside the working directory",
                rel.display()
            )));
        }
        Ok(path)
    }

    fn reap_interpreter(&mut self) {
        if let Some(mut child) = self.interpreter.take() {
            if let Err(err) = kill_tree(&mut child) {
                debug!(err = %err, "interpreter already gone");
            }
            let _ = child.wait();
        }
    }
}

impl Tee for ProcessTee {
    fn level(&self) -> IsolationLevel {
        IsolationLevel::Process
    }

    #[instrument(skip_all, fields(level = "process"))]
    fn start(&mut self) -> Result<()> {
        if self.workdir.is_some() {
            return Ok(());
        }
        let workdir = tempfile::Builder::new()
            .prefix("agentc-tee-")
            .tempdir()
            .map_err(|e| Error::TeeStart {
                level: IsolationLevel::Process,
                message: format!("create working directory: {e}"),
            })?;
        self.wrappers = self.detect_wrappers(workdir.path()).map_err(|missing| Error::TeeStart {
            level: IsolationLevel::Process,
            message: format!("strict isolation requires: {}", missing.join(", ")),
        })?;
        info!(workdir = %workdir.path().display(), wrappers = ?self.wrappers, "process boundary started");
        self.workdir = Some(workdir);
        Ok(())
    }

    #[instrument(skip_all, fields(level = "process"))]
    fn stop(&mut self) -> Result<()> {
        self.reap_interpreter();
        if let Some(workdir) = self.workdir.take() {
            let path = workdir.path().to_path_buf();
            workdir
                .close()
                .with_context(|| format!("remove {}", path.display()))
                .map_err(Error::Isolation)?;
            info!("process boundary stopped");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(level = "process", program = %request.program))]
    fn execute(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecOutput> {
        let root = self.root()?;
        let _slot = self.slot.acquire();
        let timeout = request
            .timeout
            .unwrap_or(Duration::from_secs(self.spec.limits.timeout_sec));
        let cmd = self.command(root, &request.program, &request.args, true);
        let mut opts = RunOptions::new(timeout, self.cfg.output_limit_bytes).cancel(cancel);
        opts.stdin = request.stdin.as_deref();
        let output = run_supervised(cmd, opts)
            .with_context(|| format!("run {}", request.program))
            .map_err(Error::Isolation)?;
        if output.cancelled {
            return Err(Error::Cancelled {
                stage: Stage::Isolation,
            });
        }
        if let Some(err) = classify(&output, &self.spec.limits, timeout) {
            warn!(err = %err, "command exceeded a limit");
            return Err(err);
        }
        Ok(exec_output(output))
    }

    #[instrument(skip_all, fields(level = "process", program = %program))]
    fn launch(&mut self, program: &str, args: &[String]) -> Result<()> {
        if self.interpreter_alive() {
            return Err(Error::Isolation(anyhow!("an interpreter is already running")));
        }
        let root = self.root()?.to_path_buf();
        let cmd = self.command(&root, program, args, false);
        let child = spawn_logged(cmd, &root.join(INTERPRETER_LOG)).map_err(Error::Isolation)?;
        self.interpreter = Some(child);
        Ok(())
    }

    fn interpreter_alive(&mut self) -> bool {
        match self.interpreter.as_mut().map(Child::try_wait) {
            Some(Ok(None)) => true,
            Some(Ok(Some(status))) => {
                debug!(status = %status, "interpreter exited");
                self.interpreter = None;
                false
            }
            Some(Err(_)) | None => false,
        }
    }

    fn copy_file_in(&self, host: &Path, rel: &Path) -> Result<()> {
        let dest = self.host_path(rel)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))
                .map_err(Error::Isolation)?;
        }
        // Re-check now that intermediate directories exist.
        let dest = self.host_path(rel)?;
        fs::copy(host, &dest)
            .with_context(|| format!("copy {} into boundary", host.display()))
            .map_err(Error::Isolation)?;
        Ok(())
    }

    fn copy_file_out(&self, rel: &Path, host: &Path) -> Result<()> {
        let source = self.host_path(rel)?;
        fs::copy(&source, host)
            .with_context(|| format!("copy {} out of boundary", rel.display()))
            .map_err(Error::Isolation)?;
        Ok(())
    }

    fn workdir(&self) -> Option<&Path> {
        self.workdir.as_ref().map(TempDir::path)
    }

    fn is_running(&self) -> bool {
        self.workdir.is_some()
    }
}

impl Drop for ProcessTee {
    fn drop(&mut self) {
        self.reap_interpreter();
    }
}

fn mechanism_works<S: AsRef<OsStr>>(argv: &[S]) -> bool {
    let Some((program, args)) = argv.split_first() else {
        return false;
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    matches!(
        run_command_with_timeout(cmd, None, MECHANISM_CHECK_TIMEOUT, 4096),
        Ok(output) if output.status.success()
    )
}

/// `bwrap` prefix: host read-only, private `/tmp` and `/dev`, `root` writable.
fn bwrap_args(root: &Path, deny_network: bool) -> Vec<String> {
    let root = root.display().to_string();
    let mut args: Vec<String> = [
        "bwrap",
        "--ro-bind",
        "/",
        "/",
        "--dev",
        "/dev",
        "--proc",
        "/proc",
        "--tmpfs",
        "/tmp",
        "--bind",
        root.as_str(),
        root.as_str(),
        "--chdir",
        root.as_str(),
        "--die-with-parent",
    ]
    .map(String::from)
    .to_vec();
    if deny_network {
        args.push("--unshare-net".to_string());
    }
    args.push("--".to_string());
    args
}

fn bwrap_check_args(root: &Path) -> Vec<String> {
    let mut args = bwrap_args(root, false);
    args.push("true".to_string());
    args
}

fn sandbox_profile(spec: &TeeSpec, root: &Path) -> String {
    let mut profile = String::from("(version 1)\n(allow default)\n");
    if !spec.network_access {
        profile.push_str("(deny network*)\n(allow network* (local unix-socket) (remote unix-socket))\n");
    }
    if !spec.filesystem_access {
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        profile.push_str(&format!(
            "(deny file-write*)\n(allow file-write* (subpath \"{}\") (subpath \"/dev\"))\n",
            root.display()
        ));
    }
    profile
}
