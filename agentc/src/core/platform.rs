//! Target platforms and deterministic artifact names.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetOs {
    Linux,
    Darwin,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetArch {
    Amd64,
    Arm64,
}

/// OS/architecture pair a plugin is compiled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetPlatform {
    pub os: TargetOs,
    pub arch: TargetArch,
}

impl TargetPlatform {
    pub fn new(os: TargetOs, arch: TargetArch) -> Self {
        Self { os, arch }
    }

    /// The platform this process is running on, if it is a supported target.
    pub fn host() -> Result<Self, String> {
        let os = parse_os(std::env::consts::OS)?;
        let arch = parse_arch(std::env::consts::ARCH)?;
        Ok(Self { os, arch })
    }

    /// Value for the toolchain's `GOOS`.
    pub fn goos(&self) -> &'static str {
        match self.os {
            TargetOs::Linux => "linux",
            TargetOs::Darwin => "darwin",
            TargetOs::Windows => "windows",
        }
    }

    /// Value for the toolchain's `GOARCH`.
    pub fn goarch(&self) -> &'static str {
        match self.arch {
            TargetArch::Amd64 => "amd64",
            TargetArch::Arm64 => "arm64",
        }
    }

    /// Shared-library extension for this OS.
    pub fn extension(&self) -> &'static str {
        match self.os {
            TargetOs::Linux => "so",
            TargetOs::Darwin => "dylib",
            TargetOs::Windows => "dll",
        }
    }
}

impl fmt::Display for TargetPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.goos(), self.goarch())
    }
}

impl FromStr for TargetPlatform {
    type Err = String;

    /// Parse `os/arch`, e.g. `linux/amd64` or `macos/aarch64`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (os, arch) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| format!("target '{s}' must look like os/arch"))?;
        Ok(Self {
            os: parse_os(os)?,
            arch: parse_arch(arch)?,
        })
    }
}

fn parse_os(raw: &str) -> Result<TargetOs, String> {
    match raw.to_ascii_lowercase().as_str() {
        "linux" => Ok(TargetOs::Linux),
        "darwin" | "macos" => Ok(TargetOs::Darwin),
        "windows" => Ok(TargetOs::Windows),
        other => Err(format!("unsupported target os '{other}'")),
    }
}

fn parse_arch(raw: &str) -> Result<TargetArch, String> {
    match raw.to_ascii_lowercase().as_str() {
        "amd64" | "x86_64" => Ok(TargetArch::Amd64),
        "arm64" | "aarch64" => Ok(TargetArch::Arm64),
        other => Err(format!("unsupported target arch '{other}'")),
    }
}

/// Base name shared by an artifact and its sidecar: `agent_{id}_{version}`.
pub fn artifact_stem(id: &str, version: &str) -> String {
    format!("agent_{id}_{version}")
}

/// `agent_{id}_{version}.{so|dylib|dll}`.
pub fn artifact_name(id: &str, version: &str, platform: &TargetPlatform) -> String {
    format!("{}.{}", artifact_stem(id, version), platform.extension())
}

/// `agent_{id}_{version}.manifest.json`.
pub fn manifest_name(id: &str, version: &str) -> String {
    format!("{}.manifest.json", artifact_stem(id, version))
}
