//! Declarative plugin description consumed by the compiler.
//!
//! These structs are the build input. They reject unknown fields at
//! deserialization and are never mutated once handed to the generator.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Full declarative description of one agent plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginSpec {
    /// Globally unique identifier; used in artifact and directory names.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Semantic version of this plugin build.
    pub version: String,
    pub kind: PluginKind,
    #[serde(default)]
    pub description: String,
    /// Free-text instruction handed to the agent at creation.
    #[serde(default)]
    pub instruction: String,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    #[serde(default)]
    pub resources: Vec<ResourceSpec>,
    #[serde(default)]
    pub prompts: Vec<PromptSpec>,
    /// Interpreter packages installed into the runtime bundle.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    #[serde(default)]
    pub requires_storage: bool,
    #[serde(default)]
    pub can_spawn_children: bool,
    /// Upper bound on passes for [`PluginKind::Iterative`] agents.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default)]
    pub tee: TeeSpec,
}

fn default_max_iterations() -> u32 {
    3
}

impl PluginSpec {
    /// Dependencies rendered as interpreter requirement lines, in declaration order.
    pub fn requirement_lines(&self) -> Vec<String> {
        self.dependencies.iter().map(Dependency::requirement).collect()
    }
}

/// How the agent composes its tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    SingleModel,
    Sequential,
    Parallel,
    Iterative,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PluginKind::SingleModel => "single_model",
            PluginKind::Sequential => "sequential",
            PluginKind::Parallel => "parallel",
            PluginKind::Iterative => "iterative",
        }
    }
}

/// One invocation-capable unit exposed to the plugin's interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolSpec {
    /// Unique within the plugin; also the interpreter function name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default = "default_returns")]
    pub returns: ValueType,
    pub implementation: Implementation,
}

fn default_returns() -> ValueType {
    ValueType::String
}

/// Where a tool's interpreter source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase", deny_unknown_fields)]
pub enum Implementation {
    /// Source code inlined into the generated module.
    Inline { code: String },
    /// Source file copied verbatim into the tree. Relative paths resolve
    /// against the directory of the spec file.
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Nested field schema for `object` parameters.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub properties: Vec<ParameterSpec>,
    /// Element type for `array` parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ValueType>,
}

fn default_required() -> bool {
    true
}

/// Primitive and composite type tags for tool parameters and results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::String => "string",
            ValueType::Integer => "integer",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Array => "array",
            ValueType::Object => "object",
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, ValueType::Array | ValueType::Object)
    }

    /// True if `value` is a JSON value of this type.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        match self {
            ValueType::String => value.is_string(),
            ValueType::Integer => value.is_i64() || value.is_u64(),
            ValueType::Number => value.is_number(),
            ValueType::Boolean => value.is_boolean(),
            ValueType::Array => value.is_array(),
            ValueType::Object => value.is_object(),
        }
    }
}

/// Named opaque payload bound into the artifact at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub data: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", deny_unknown_fields)]
pub enum Payload {
    Text(String),
    /// Standard base64 (RFC 4648, with padding).
    Base64(String),
}

impl Payload {
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        use base64::Engine as _;
        match self {
            Payload::Text(text) => Ok(text.as_bytes().to_vec()),
            Payload::Base64(encoded) => base64::engine::general_purpose::STANDARD.decode(encoded),
        }
    }
}

/// Named prompt text; shares the resource namespace when embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PromptSpec {
    pub name: String,
    pub text: String,
}

/// Interpreter package requirement, optionally pinned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Dependency {
    /// Normalized package name (case-insensitive, `_`/`.` equivalent to `-`).
    pub fn normalized_name(&self) -> String {
        self.name
            .trim()
            .to_ascii_lowercase()
            .replace(['_', '.'], "-")
    }

    pub fn requirement(&self) -> String {
        match &self.version {
            Some(version) => format!("{}=={}", self.name.trim(), version.trim()),
            None => self.name.trim().to_string(),
        }
    }
}

/// Isolation policy for the plugin's interpreter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TeeSpec {
    pub isolation: IsolationLevel,
    pub limits: ResourceLimits,
    pub network_access: bool,
    pub filesystem_access: bool,
}

impl Default for TeeSpec {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Process,
            limits: ResourceLimits::default(),
            network_access: false,
            filesystem_access: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Process,
    Container,
    Vm,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::Process => "process",
            IsolationLevel::Container => "container",
            IsolationLevel::Vm => "vm",
        };
        f.write_str(name)
    }
}

/// Ceilings applied to every command run inside the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    /// CPU share in cores (`0.5` = half a core).
    pub cpu_cores: f64,
    /// Hard wall-clock limit per `execute` call.
    pub timeout_sec: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_cores: 1.0,
            timeout_sec: 30,
        }
    }
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb.saturating_mul(1024 * 1024)
    }

    /// CPU-time budget equivalent to `cpu_cores` sustained over the timeout window.
    pub fn cpu_seconds(&self) -> u64 {
        ((self.cpu_cores * self.timeout_sec as f64).ceil() as u64).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_spec_fills_defaults() {
        let spec: PluginSpec = serde_json::from_str(
            r#"{"id":"a1","name":"A","version":"0.1.0","kind":"single_model"}"#,
        )
        .expect("parse");
        assert_eq!(spec.tee, TeeSpec::default());
        assert_eq!(spec.max_iterations, 3);
        assert!(spec.tools.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<PluginSpec>(
            r#"{"id":"a1","name":"A","version":"0.1.0","kind":"single_model","colour":"red"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("colour"));
    }

    #[test]
    fn implementation_is_tagged_by_source() {
        let tool: ToolSpec = serde_json::from_str(
            r#"{"name":"echo","implementation":{"source":"file","path":"tools/echo.py"}}"#,
        )
        .expect("parse");
        assert_eq!(
            tool.implementation,
            Implementation::File {
                path: PathBuf::from("tools/echo.py")
            }
        );
        assert_eq!(tool.returns, ValueType::String);
    }

    #[test]
    fn base64_payload_decodes() {
        let payload = Payload::Base64("AAEC/w==".to_string());
        assert_eq!(payload.bytes().expect("decode"), vec![0, 1, 2, 255]);
    }

    #[test]
    fn dependency_names_normalize() {
        let dep = Dependency {
            name: "Typing_Extensions".into(),
            version: Some("4.12.2".into()),
        };
        assert_eq!(dep.normalized_name(), "typing-extensions");
        assert_eq!(dep.requirement(), "Typing_Extensions==4.12.2");
    }

    #[test]
    fn cpu_budget_scales_with_timeout() {
        let limits = ResourceLimits {
            memory_mb: 64,
            cpu_cores: 0.5,
            timeout_sec: 3,
        };
        assert_eq!(limits.cpu_seconds(), 2);
        assert_eq!(limits.memory_bytes(), 64 * 1024 * 1024);
    }
}
