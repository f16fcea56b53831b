//! Agent plugin compiler, isolation boundary, and plugin runtime.
//!
//! A [`core::spec::PluginSpec`] flows through a fixed pipeline:
//!
//! - **[`generate`]**: renders a fresh source tree from templates and embedded
//!   resources.
//! - **[`build`]**: runs the external toolchain against that tree and produces
//!   a loadable artifact plus a sidecar manifest.
//! - **[`plugin`]**: loads the artifact, starts its interpreter inside a
//!   [`tee`] boundary, and serves agent requests.
//!
//! As in any pipeline with side effects, the split is strict:
//!
//! - **[`core`]**: Pure, deterministic logic (spec model, validation, template
//!   substitution, literal embedding, platform naming, lifecycle transitions).
//! - **[`io`]**: Side-effecting helpers (config, subprocesses, spec loading,
//!   the registry store).

pub mod build;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod generate;
pub mod io;
pub mod logging;
pub mod plugin;
pub mod protocol;
pub mod tee;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use error::{Error, Result, Stage};
