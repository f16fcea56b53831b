//! Toolchain invocation for a generated source tree.
//!
//! One call is one attempt. A toolchain that exits non-zero yields an
//! unsuccessful [`BuildResult`] carrying its full stderr; only failures to
//! run the toolchain at all are errors. Nothing retries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::Sender;
use std::time::Duration;

use anyhow::{Context, anyhow};
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::core::cancel::CancelToken;
use crate::core::platform::{TargetPlatform, artifact_name, manifest_name};
use crate::core::spec::PluginSpec;
use crate::error::{Error, Result, Stage};
use crate::generate::{BuildDirGuard, RUNTIME_DIR, SourceTree};
use crate::io::config::ToolchainConfig;
use crate::io::process::{OutputLine, RunOptions, run_supervised};

/// Sidecar manifest format written next to every artifact.
pub const MANIFEST_FORMAT: u32 = 1;

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Where the artifact and its sidecar manifest are written.
    pub out_dir: PathBuf,
    /// Toolchain command; `-o <artifact>` and `.` are appended.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub keep_build_dir: bool,
    /// Receives toolchain output line by line while it runs.
    pub progress: Option<Sender<OutputLine>>,
}

impl BuildOptions {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(&ToolchainConfig::default(), out_dir)
    }

    pub fn from_config(cfg: &ToolchainConfig, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            command: cfg.command.clone(),
            env: cfg.env.clone(),
            timeout: Duration::from_secs(cfg.timeout_secs),
            output_limit_bytes: cfg.output_limit_bytes,
            keep_build_dir: cfg.keep_build_dir,
            progress: None,
        }
    }
}

/// Outcome of one toolchain attempt. Never mutated after return.
#[derive(Debug, Clone)]
pub struct BuildResult {
    pub success: bool,
    pub platform: TargetPlatform,
    pub artifact: Option<PathBuf>,
    pub manifest: Option<PathBuf>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    pub build_dir: PathBuf,
    pub build_dir_retained: bool,
}

impl BuildResult {
    /// The artifact path, or the toolchain's diagnostics as an error.
    pub fn into_artifact(self) -> Result<PathBuf> {
        match (self.success, self.artifact) {
            (true, Some(artifact)) => Ok(artifact),
            _ => Err(Error::Toolchain {
                status: self.exit_code,
                stderr: self.stderr,
            }),
        }
    }
}

/// Sidecar written next to an artifact: what was built, for which target,
/// its checksum, and the interpreter bundle it carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub format: u32,
    pub spec: PluginSpec,
    /// `os/arch`.
    pub platform: String,
    /// Artifact file name, relative to the manifest's directory.
    pub artifact: String,
    pub sha256: String,
    pub built_at: DateTime<Utc>,
    /// Bundle files (relative path → base64 contents).
    pub runtime: BTreeMap<String, String>,
}

impl ArtifactManifest {
    /// Decoded bundle files in path order.
    pub fn runtime_files(&self) -> anyhow::Result<Vec<(PathBuf, Vec<u8>)>> {
        self.runtime
            .iter()
            .map(|(path, encoded)| {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .with_context(|| format!("decode bundle file {path}"))?;
                Ok((PathBuf::from(path), bytes))
            })
            .collect()
    }
}

/// Build `tree` for `platform` into `options.out_dir`.
#[instrument(skip_all, fields(id = %tree.spec.id, version = %tree.spec.version, platform = %platform))]
pub fn build(
    tree: &SourceTree,
    platform: &TargetPlatform,
    options: &BuildOptions,
    cancel: &CancelToken,
) -> Result<BuildResult> {
    let guard = BuildDirGuard::new(tree.root.clone());
    let retained = options.keep_build_dir;
    if retained {
        guard.disarm();
    }
    // Dropping `guard` on any return path below removes the build directory.

    let (program, base_args) = options
        .command
        .split_first()
        .ok_or_else(|| Error::Build(anyhow!("toolchain command is empty")))?;
    fs::create_dir_all(&options.out_dir)
        .with_context(|| format!("create output dir {}", options.out_dir.display()))
        .map_err(Error::Build)?;
    let out_dir = std::path::absolute(&options.out_dir)
        .with_context(|| format!("resolve {}", options.out_dir.display()))
        .map_err(Error::Build)?;
    let artifact = out_dir.join(artifact_name(&tree.spec.id, &tree.spec.version, platform));
    let sidecar = out_dir.join(manifest_name(&tree.spec.id, &tree.spec.version));
    for stale in [&artifact, &sidecar] {
        if stale.exists() {
            warn!(path = %stale.display(), "replacing output of a previous build");
            fs::remove_file(stale)
                .with_context(|| format!("remove stale {}", stale.display()))
                .map_err(Error::Build)?;
        }
    }

    let mut cmd = Command::new(program);
    cmd.args(base_args)
        .arg("-o")
        .arg(&artifact)
        .arg(".")
        .current_dir(&tree.root)
        .env("GOOS", platform.goos())
        .env("GOARCH", platform.goarch())
        .env("CGO_ENABLED", "1")
        .envs(&options.env);

    let mut run = RunOptions::new(options.timeout, options.output_limit_bytes).cancel(cancel);
    run.lines = options.progress.clone();
    info!(program = %program, "running toolchain");
    let output = run_supervised(cmd, run)
        .with_context(|| format!("run toolchain {program}"))
        .map_err(Error::Build)?;

    if output.cancelled {
        return Err(Error::Cancelled {
            stage: Stage::Build,
        });
    }
    let stdout = output.stdout_lossy();
    let stderr = format!(
        "{}{}",
        output.stderr_lossy(),
        output.stderr_truncated_notice("toolchain")
    );
    if output.timed_out {
        return Err(Error::Build(anyhow!(
            "toolchain timed out after {}s:\n{stderr}",
            options.timeout.as_secs()
        )));
    }
    let mut result = BuildResult {
        success: false,
        platform: *platform,
        artifact: None,
        manifest: None,
        stdout,
        stderr,
        exit_code: output.status.code(),
        elapsed: output.elapsed,
        build_dir: tree.root.clone(),
        build_dir_retained: retained,
    };

    if !output.status.success() {
        warn!(exit_code = ?result.exit_code, "toolchain failed");
        return Ok(result);
    }
    if !artifact.is_file() {
        return Err(Error::Build(anyhow!(
            "toolchain exited 0 but produced no artifact at {}",
            artifact.display()
        )));
    }

    let manifest = write_manifest(tree, platform, &artifact, &out_dir).map_err(Error::Build)?;
    info!(artifact = %artifact.display(), elapsed_ms = result.elapsed.as_millis() as u64, "build succeeded");
    result.success = true;
    result.artifact = Some(artifact);
    result.manifest = Some(manifest);
    Ok(result)
}

fn write_manifest(
    tree: &SourceTree,
    platform: &TargetPlatform,
    artifact: &Path,
    out_dir: &Path,
) -> anyhow::Result<PathBuf> {
    let bytes = fs::read(artifact).with_context(|| format!("read {}", artifact.display()))?;
    let manifest = ArtifactManifest {
        format: MANIFEST_FORMAT,
        spec: tree.spec.clone(),
        platform: platform.to_string(),
        artifact: artifact_name(&tree.spec.id, &tree.spec.version, platform),
        sha256: hex::encode(Sha256::digest(&bytes)),
        built_at: Utc::now(),
        runtime: collect_bundle(&tree.root.join(RUNTIME_DIR))?,
    };
    let path = out_dir.join(manifest_name(&tree.spec.id, &tree.spec.version));
    let mut buf = serde_json::to_vec_pretty(&manifest).context("serialize manifest")?;
    buf.push(b'\n');
    crate::io::write_atomic(&path, &buf)?;
    Ok(path)
}

/// Every file under the bundle directory, keyed by `/`-separated relative path.
fn collect_bundle(dir: &Path) -> anyhow::Result<BTreeMap<String, String>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .with_context(|| format!("relativize {}", entry.path().display()))?;
        let key = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let bytes =
            fs::read(entry.path()).with_context(|| format!("read {}", entry.path().display()))?;
        files.insert(
            key,
            base64::engine::general_purpose::STANDARD.encode(bytes),
        );
    }
    Ok(files)
}
