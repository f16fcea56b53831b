//! Stable exit codes for agentc CLI commands.

use crate::error::{Error, Stage};

/// Command succeeded.
pub const OK: i32 = 0;
/// The plugin spec or config is invalid, or the command was misused.
pub const INVALID: i32 = 1;
/// Source generation failed.
pub const GENERATION_FAILED: i32 = 2;
/// The toolchain rejected the generated tree.
pub const BUILD_FAILED: i32 = 3;
/// The isolation boundary or interpreter failed while running a plugin.
pub const RUNTIME_FAILED: i32 = 4;

/// Map an error to the exit code for its originating stage.
pub fn for_error(err: &Error) -> i32 {
    match err.stage() {
        Stage::Validation => INVALID,
        Stage::Generation => GENERATION_FAILED,
        Stage::Build => BUILD_FAILED,
        Stage::Isolation | Stage::Interpreter | Stage::Registry | Stage::Lifecycle => {
            RUNTIME_FAILED
        }
    }
}
