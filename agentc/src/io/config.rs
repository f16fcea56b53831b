//! agentc configuration stored in `agentc.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Default config file name, looked up in the working directory.
pub const CONFIG_FILE: &str = "agentc.toml";

/// agentc configuration (TOML).
///
/// Process-wide defaults for the compiler and runtime. Missing fields default
/// to values that work on a developer machine with Go and Python installed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentcConfig {
    pub paths: PathsConfig,
    pub toolchain: ToolchainConfig,
    pub interpreter: InterpreterConfig,
    pub tee: TeeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Override directory for code templates. Built-in templates when unset.
    pub template_dir: Option<PathBuf>,
    /// Where build directories and artifacts are written.
    pub output_dir: PathBuf,
    /// Root of the file-backed registry.
    pub registry_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            template_dir: None,
            output_dir: PathBuf::from("build"),
            registry_dir: PathBuf::from(".agentc/registry"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolchainConfig {
    /// Build command; `-o <artifact>` and `.` are appended.
    pub command: Vec<String>,
    /// Language version written to the generated `go.mod`.
    pub go_version: String,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    /// Keep the generated build directory after the toolchain ran.
    pub keep_build_dir: bool,
    /// Extra environment for the toolchain (e.g. `CC` for cross builds).
    pub env: BTreeMap<String, String>,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "go".to_string(),
                "build".to_string(),
                "-buildmode=c-shared".to_string(),
                "-trimpath".to_string(),
            ],
            go_version: "1.22".to_string(),
            timeout_secs: 10 * 60,
            output_limit_bytes: 1_000_000,
            keep_build_dir: false,
            env: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Interpreter executable inside the isolation boundary.
    pub command: String,
    pub health_attempts: u32,
    /// Pause between health attempts.
    pub health_backoff_ms: u64,
    /// Install pinned packages into the bundle when the plugin declares any.
    pub pip_install: bool,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            health_attempts: 30,
            health_backoff_ms: 200,
            pip_install: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TeeConfig {
    /// Fail `start` when a confinement mechanism is unavailable instead of warning.
    pub strict: bool,
    /// `docker` or `podman`.
    pub container_runtime: String,
    pub container_image: String,
    /// OCI runtime that backs VM isolation.
    pub vm_oci_runtime: String,
    pub output_limit_bytes: usize,
    /// Timeout for management commands (container create, copy, remove).
    pub management_timeout_secs: u64,
}

impl Default for TeeConfig {
    fn default() -> Self {
        Self {
            strict: false,
            container_runtime: "docker".to_string(),
            container_image: "python:3.12-slim".to_string(),
            vm_oci_runtime: "kata-runtime".to_string(),
            output_limit_bytes: 1_000_000,
            management_timeout_secs: 120,
        }
    }
}

impl Default for AgentcConfig {
    fn default() -> Self {
        Self {
            paths: PathsConfig::default(),
            toolchain: ToolchainConfig::default(),
            interpreter: InterpreterConfig::default(),
            tee: TeeConfig::default(),
        }
    }
}

impl AgentcConfig {
    pub fn validate(&self) -> Result<()> {
        if self.toolchain.command.is_empty() || self.toolchain.command[0].trim().is_empty() {
            return Err(anyhow!("toolchain.command must be a non-empty array"));
        }
        if self.toolchain.timeout_secs == 0 {
            return Err(anyhow!("toolchain.timeout_secs must be > 0"));
        }
        if self.toolchain.output_limit_bytes == 0 {
            return Err(anyhow!("toolchain.output_limit_bytes must be > 0"));
        }
        if self.toolchain.go_version.trim().is_empty() {
            return Err(anyhow!("toolchain.go_version must not be empty"));
        }
        if self.interpreter.command.trim().is_empty() {
            return Err(anyhow!("interpreter.command must not be empty"));
        }
        if self.interpreter.health_attempts == 0 {
            return Err(anyhow!("interpreter.health_attempts must be > 0"));
        }
        if !matches!(self.tee.container_runtime.as_str(), "docker" | "podman") {
            return Err(anyhow!(
                "tee.container_runtime must be \"docker\" or \"podman\", got {:?}",
                self.tee.container_runtime
            ));
        }
        if self.tee.container_image.trim().is_empty() {
            return Err(anyhow!("tee.container_image must not be empty"));
        }
        if self.tee.output_limit_bytes == 0 {
            return Err(anyhow!("tee.output_limit_bytes must be > 0"));
        }
        if self.tee.management_timeout_secs == 0 {
            return Err(anyhow!("tee.management_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentcConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentcConfig> {
    if !path.exists() {
        let cfg = AgentcConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentcConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentcConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentcConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentc.toml");
        let mut cfg = AgentcConfig::default();
        cfg.paths.template_dir = Some(PathBuf::from("templates"));
        cfg.toolchain.env.insert("CC".into(), "zig cc".into());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agentc.toml");
        fs::write(&path, "[tee]\ncontainer_runtime = \"podman\"\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.tee.container_runtime, "podman");
        assert_eq!(cfg.toolchain, ToolchainConfig::default());
    }

    #[test]
    fn rejects_unknown_container_runtime() {
        let mut cfg = AgentcConfig::default();
        cfg.tee.container_runtime = "lxc".into();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("container_runtime"));
    }
}
