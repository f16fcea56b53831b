//! Plugin spec loading with schema + invariant validation.

use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::invariants::validate_spec;
use crate::core::spec::PluginSpec;
use crate::error::{Error, Result};

/// JSON Schema (draft 2020-12) every plugin spec document must satisfy.
pub const PLUGIN_SPEC_SCHEMA: &str = include_str!("../../schemas/plugin_spec/v1.schema.json");

/// A validated spec plus the directory its relative file references resolve against.
#[derive(Debug, Clone)]
pub struct SpecFile {
    pub spec: PluginSpec,
    pub base_dir: PathBuf,
}

/// Read, schema-check, deserialize, and invariant-check a spec file.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_spec(path: &Path) -> Result<SpecFile> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::SpecValidation(vec![format!("read {}: {e}", path.display())]))?;
    let spec = parse_spec(&raw)?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    debug!(id = %spec.id, version = %spec.version, "loaded plugin spec");
    Ok(SpecFile { spec, base_dir })
}

/// Parse and validate a spec document: schema conformance, then semantic invariants.
///
/// Every violation is reported at once; nothing is deferred to first use.
pub fn parse_spec(raw: &str) -> Result<PluginSpec> {
    let instance: Value = serde_json::from_str(raw)
        .map_err(|e| Error::SpecValidation(vec![format!("parse spec json: {e}")]))?;
    let messages = schema_errors(&instance)?;
    if !messages.is_empty() {
        return Err(Error::SpecValidation(messages));
    }
    let spec: PluginSpec = serde_json::from_value(instance)
        .map_err(|e| Error::SpecValidation(vec![format!("parse spec as v1 struct: {e}")]))?;
    check_spec(&spec)?;
    Ok(spec)
}

/// Semantic invariants only, for specs built in code.
pub fn check_spec(spec: &PluginSpec) -> Result<()> {
    let errors = validate_spec(spec);
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::SpecValidation(errors))
    }
}

fn schema_errors(instance: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(PLUGIN_SPEC_SCHEMA)
        .map_err(|e| Error::SpecValidation(vec![format!("parse embedded schema: {e}")]))?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .map_err(|e| Error::SpecValidation(vec![format!("compile json schema: {e}")]))?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}
