//! Semantic invariants not expressible via JSON Schema.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::embed::ident_for;
use crate::core::spec::{ParameterSpec, PluginKind, PluginSpec, ToolSpec, ValueType};

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("id regex"));
static SEMVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(0|[1-9]\d*)\.(0|[1-9]\d*)\.(0|[1-9]\d*)(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?$")
        .expect("semver regex")
});
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("ident regex"));

/// Check semantic invariants of a plugin spec:
/// - Identifier, version, and name are well formed
/// - Tool names are unique identifiers; parameter names unique per tool
/// - Required parameters carry no default; defaults match their type
/// - Nested schemas only on composite parameter types
/// - Resource and prompt names unique across both lists, before and after
///   identifier derivation
/// - No package pinned to two different versions
/// - Resource ceilings are positive
///
/// Returns every violation found, in a stable order. Touches no filesystem.
pub fn validate_spec(spec: &PluginSpec) -> Vec<String> {
    let mut errors = Vec::new();

    if !ID_RE.is_match(&spec.id) {
        errors.push(format!(
            "id '{}' must match [A-Za-z0-9][A-Za-z0-9_-]* (max 64 chars)",
            spec.id
        ));
    }
    if !SEMVER_RE.is_match(&spec.version) {
        errors.push(format!("version '{}' is not a semantic version", spec.version));
    }
    if spec.name.trim().is_empty() {
        errors.push("name must not be empty".to_string());
    }
    if spec.kind == PluginKind::Iterative && spec.max_iterations == 0 {
        errors.push("max_iterations must be > 0 for iterative plugins".to_string());
    }

    validate_tools(&spec.tools, &mut errors);
    validate_payload_names(spec, &mut errors);
    validate_dependencies(spec, &mut errors);

    let limits = &spec.tee.limits;
    if limits.memory_mb == 0 {
        errors.push("tee.limits.memory_mb must be > 0".to_string());
    }
    if !(limits.cpu_cores.is_finite() && limits.cpu_cores > 0.0) {
        errors.push("tee.limits.cpu_cores must be a positive number".to_string());
    }
    if limits.timeout_sec == 0 {
        errors.push("tee.limits.timeout_sec must be > 0".to_string());
    }

    errors
}

fn validate_tools(tools: &[ToolSpec], errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for tool in tools {
        if !seen.insert(tool.name.as_str()) {
            errors.push(format!("duplicate tool name '{}'", tool.name));
        }
        if !IDENT_RE.is_match(&tool.name) {
            errors.push(format!(
                "tool name '{}' must be an identifier ([A-Za-z_][A-Za-z0-9_]*)",
                tool.name
            ));
        }
        validate_parameters(&format!("tool '{}'", tool.name), &tool.parameters, errors);
    }
}

fn validate_parameters(path: &str, params: &[ParameterSpec], errors: &mut Vec<String>) {
    let mut seen = HashSet::new();
    for param in params {
        let param_path = format!("{path} parameter '{}'", param.name);
        if param.name.trim().is_empty() {
            errors.push(format!("{path}: parameter name must not be empty"));
        }
        if !seen.insert(param.name.as_str()) {
            errors.push(format!("{path}: duplicate parameter name '{}'", param.name));
        }
        if let Some(default) = &param.default {
            if param.required {
                errors.push(format!("{param_path}: required parameters cannot have a default"));
            }
            if !param.ty.accepts(default) {
                errors.push(format!(
                    "{param_path}: default does not match type {}",
                    param.ty.as_str()
                ));
            }
        }
        if !param.properties.is_empty() && param.ty != ValueType::Object {
            errors.push(format!("{param_path}: properties only allowed on object parameters"));
        }
        if param.items.is_some() && param.ty != ValueType::Array {
            errors.push(format!("{param_path}: items only allowed on array parameters"));
        }
        validate_parameters(&param_path, &param.properties, errors);
    }
}

fn validate_payload_names(spec: &PluginSpec, errors: &mut Vec<String>) {
    let mut names = HashSet::new();
    let mut idents: HashMap<String, String> = HashMap::new();

    let resources = spec
        .resources
        .iter()
        .map(|r| ("resource", r.name.as_str()));
    let prompts = spec.prompts.iter().map(|p| ("prompt", p.name.as_str()));
    for (label, name) in resources.chain(prompts) {
        if name.is_empty() {
            errors.push(format!("{label} name must not be empty"));
            continue;
        }
        if !names.insert(name) {
            errors.push(format!("duplicate resource/prompt name '{name}'"));
            continue;
        }
        let ident = ident_for(name);
        if let Some(other) = idents.insert(ident.clone(), name.to_string()) {
            errors.push(format!(
                "{label} '{name}' and '{other}' both embed as identifier {ident}"
            ));
        }
    }

    for resource in &spec.resources {
        if let Err(err) = resource.data.bytes() {
            errors.push(format!("resource '{}': invalid base64: {err}", resource.name));
        }
    }
}

fn validate_dependencies(spec: &PluginSpec, errors: &mut Vec<String>) {
    let mut pinned: HashMap<String, &str> = HashMap::new();
    for dep in &spec.dependencies {
        if dep.name.trim().is_empty() {
            errors.push("dependency name must not be empty".to_string());
            continue;
        }
        let Some(version) = dep.version.as_deref() else {
            continue;
        };
        let key = dep.normalized_name();
        match pinned.get(&key) {
            Some(existing) if *existing != version => errors.push(format!(
                "dependency '{}' pinned to conflicting versions {} and {}",
                dep.name, existing, version
            )),
            Some(_) => {}
            None => {
                pinned.insert(key, version);
            }
        }
    }
}
