//! Error taxonomy shared by the compiler, the isolation layer, and the runtime.
//!
//! Every variant belongs to exactly one [`Stage`]. Toolchain and interpreter
//! diagnostics are carried verbatim. Nothing in this crate retries on its own;
//! [`Error::is_retryable`] tells a caller which failures may succeed under a
//! different strategy.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::lifecycle::LifecycleState;
use crate::core::spec::IsolationLevel;

pub type Result<T> = std::result::Result<T, Error>;

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Validation,
    Generation,
    Build,
    Isolation,
    Interpreter,
    Registry,
    Lifecycle,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Validation => "validation",
            Stage::Generation => "generation",
            Stage::Build => "build",
            Stage::Isolation => "isolation",
            Stage::Interpreter => "interpreter",
            Stage::Registry => "registry",
            Stage::Lifecycle => "lifecycle",
        };
        f.write_str(name)
    }
}

/// Resource ceiling that a supervised process ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    WallClock,
    Memory,
    Cpu,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::WallClock => "wall-clock",
            Resource::Memory => "memory",
            Resource::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("plugin spec is invalid:\n- {}", .0.join("\n- "))]
    SpecValidation(Vec<String>),

    #[error("template {name} not found at {}", path.display())]
    TemplateMissing { name: String, path: PathBuf },

    #[error("tool '{tool}' references missing implementation file {}", path.display())]
    ToolFileMissing { tool: String, path: PathBuf },

    #[error("code generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),

    #[error("toolchain exited with status {status:?}:\n{stderr}")]
    Toolchain { status: Option<i32>, stderr: String },

    #[error("build failed: {0:#}")]
    Build(#[source] anyhow::Error),

    #[error("{level} isolation failed to start: {message}")]
    TeeStart {
        level: IsolationLevel,
        message: String,
    },

    #[error("{resource} limit exceeded ({limit})")]
    ResourceExceeded {
        resource: Resource,
        limit: String,
        stderr: String,
    },

    #[error("isolation boundary error: {0:#}")]
    Isolation(#[source] anyhow::Error),

    #[error("interpreter reported an error: {message}")]
    Interpreter { message: String },

    #[error("interpreter transport failed: {0:#}")]
    Transport(#[source] anyhow::Error),

    #[error("registry error: {0:#}")]
    Registry(#[source] anyhow::Error),

    #[error("cannot {operation} while plugin is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("{stage} cancelled")]
    Cancelled { stage: Stage },
}

impl Error {
    pub fn stage(&self) -> Stage {
        match self {
            Error::SpecValidation(_) => Stage::Validation,
            Error::TemplateMissing { .. } | Error::ToolFileMissing { .. } | Error::Generation(_) => {
                Stage::Generation
            }
            Error::Toolchain { .. } | Error::Build(_) => Stage::Build,
            Error::TeeStart { .. } | Error::ResourceExceeded { .. } | Error::Isolation(_) => {
                Stage::Isolation
            }
            Error::Interpreter { .. } | Error::Transport(_) => Stage::Interpreter,
            Error::Registry(_) => Stage::Registry,
            Error::InvalidState { .. } => Stage::Lifecycle,
            Error::Cancelled { stage } => *stage,
        }
    }

    /// True for a wall-clock limit violation.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ResourceExceeded {
                resource: Resource::WallClock,
                ..
            }
        )
    }

    /// Failures a caller may retry with a different strategy (relaxed limits,
    /// another isolation level). Validation and generation errors are caller
    /// defects and never qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Toolchain { .. } | Error::TeeStart { .. } | Error::ResourceExceeded { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_follow_variants() {
        assert_eq!(Error::SpecValidation(vec![]).stage(), Stage::Validation);
        assert_eq!(
            Error::ToolFileMissing {
                tool: "echo".into(),
                path: "missing.py".into()
            }
            .stage(),
            Stage::Generation
        );
        assert_eq!(
            Error::Cancelled {
                stage: Stage::Build
            }
            .stage(),
            Stage::Build
        );
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!Error::SpecValidation(vec!["bad".into()]).is_retryable());
        assert!(
            Error::Toolchain {
                status: Some(2),
                stderr: "boom".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn toolchain_error_keeps_stderr_verbatim() {
        let err = Error::Toolchain {
            status: Some(1),
            stderr: "main.go:3:1: syntax error".into(),
        };
        assert!(err.to_string().contains("main.go:3:1: syntax error"));
    }
}
