//! Source tree generation: one fresh build directory per plugin build.
//!
//! Everything that can fail on input (spec invariants, templates, tool
//! implementation files) is checked before the build directory exists. Once
//! the directory is created, a guard removes it again unless generation
//! completes.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use base64::Engine as _;
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::embed::{embed, ident_for};
use crate::core::platform::{TargetPlatform, artifact_name};
use crate::core::spec::{Implementation, ParameterSpec, PluginSpec};
use crate::core::template::{Bindings, render, unbound};
use crate::error::{Error, Result};
use crate::io::spec_store::check_spec;
use crate::io::templates::{
    BOOTSTRAP_PY, GO_MOD, MAIN_GO, RESOURCES_GO, TOOL_GO, TOOL_PY, TemplateSet,
};

/// Language version written to `go.mod` when none is configured.
pub const DEFAULT_GO_VERSION: &str = "1.22";

/// Directory inside the tree holding the interpreter bundle.
pub const RUNTIME_DIR: &str = "runtime";

/// Python package inside the bundle holding one module per tool.
pub const TOOLS_PACKAGE: &str = "agent_tools";

const BUILD_DIR_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    /// Parent of the build directory.
    pub out_dir: PathBuf,
    /// Directory that relative tool file references resolve against.
    pub base_dir: PathBuf,
    pub go_version: String,
}

impl GenerateOptions {
    pub fn new(out_dir: impl Into<PathBuf>, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
            base_dir: base_dir.into(),
            go_version: DEFAULT_GO_VERSION.to_string(),
        }
    }
}

/// A generated, buildable source tree.
#[derive(Debug, Clone)]
pub struct SourceTree {
    /// `agent_{id}_{version}_{timestamp}_{random}` under the output directory.
    pub root: PathBuf,
    pub spec: PluginSpec,
    /// Files written, relative to `root`, in generation order.
    pub files: Vec<PathBuf>,
}

impl SourceTree {
    pub fn go_files(&self) -> Vec<&Path> {
        self.files
            .iter()
            .filter(|path| path.extension().is_some_and(|ext| ext == "go"))
            .map(PathBuf::as_path)
            .collect()
    }

    /// Interpreter bundle files, relative to the bundle directory.
    pub fn runtime_files(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .filter_map(|path| path.strip_prefix(RUNTIME_DIR).ok())
            .map(Path::to_path_buf)
            .collect()
    }

    pub fn artifact_name(&self, platform: &TargetPlatform) -> String {
        artifact_name(&self.spec.id, &self.spec.version, platform)
    }
}

/// Generate a source tree with default options.
pub fn generate(
    spec: &PluginSpec,
    templates: &TemplateSet,
    out_dir: &Path,
    base_dir: &Path,
) -> Result<SourceTree> {
    generate_with(spec, templates, &GenerateOptions::new(out_dir, base_dir))
}

#[instrument(skip_all, fields(id = %spec.id, version = %spec.version, out_dir = %opts.out_dir.display()))]
pub fn generate_with(
    spec: &PluginSpec,
    templates: &TemplateSet,
    opts: &GenerateOptions,
) -> Result<SourceTree> {
    check_spec(spec)?;
    let loaded = LoadedTemplates::load(templates)?;
    let impl_files = read_tool_files(spec, &opts.base_dir)?;
    let rendered = render_tree(spec, &loaded, impl_files, &opts.go_version)?;

    fs::create_dir_all(&opts.out_dir)
        .with_context(|| format!("create output dir {}", opts.out_dir.display()))
        .map_err(Error::Generation)?;
    let root = create_build_dir(&opts.out_dir, spec).map_err(Error::Generation)?;
    let guard = BuildDirGuard::new(root.clone());

    let mut files = Vec::with_capacity(rendered.len());
    for (rel, contents) in rendered {
        let path = root.join(&rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))
                .map_err(Error::Generation)?;
        }
        fs::write(&path, contents)
            .with_context(|| format!("write {}", path.display()))
            .map_err(Error::Generation)?;
        files.push(rel);
    }

    guard.disarm();
    info!(root = %root.display(), files = files.len(), "generated source tree");
    Ok(SourceTree {
        root,
        spec: spec.clone(),
        files,
    })
}

struct LoadedTemplates {
    main_go: String,
    tool_go: String,
    resources_go: String,
    go_mod: String,
    bootstrap_py: String,
    tool_py: String,
}

impl LoadedTemplates {
    fn load(set: &TemplateSet) -> Result<Self> {
        Ok(Self {
            main_go: set.load(MAIN_GO)?,
            tool_go: set.load(TOOL_GO)?,
            resources_go: set.load(RESOURCES_GO)?,
            go_mod: set.load(GO_MOD)?,
            bootstrap_py: set.load(BOOTSTRAP_PY)?,
            tool_py: set.load(TOOL_PY)?,
        })
    }
}

/// Verbatim contents of every file-referenced tool implementation, by tool name.
fn read_tool_files(spec: &PluginSpec, base_dir: &Path) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for tool in &spec.tools {
        let Implementation::File { path } = &tool.implementation else {
            continue;
        };
        let resolved = if path.is_absolute() {
            path.clone()
        } else {
            base_dir.join(path)
        };
        let contents = fs::read(&resolved).map_err(|_| Error::ToolFileMissing {
            tool: tool.name.clone(),
            path: resolved.clone(),
        })?;
        files.insert(tool.name.clone(), contents);
    }
    Ok(files)
}

/// Interpreter-side view of the plugin, embedded in the bootstrap.
#[derive(Serialize)]
struct RuntimeConfig<'a> {
    id: &'a str,
    name: &'a str,
    version: &'a str,
    kind: &'static str,
    description: &'a str,
    instruction: &'a str,
    max_iterations: u32,
    requires_storage: bool,
    can_spawn_children: bool,
    tools: Vec<RuntimeTool<'a>>,
    prompts: BTreeMap<&'a str, &'a str>,
    /// Resource and prompt names mapped to their staged file names.
    resources: BTreeMap<&'a str, String>,
}

#[derive(Serialize)]
struct RuntimeTool<'a> {
    name: &'a str,
    description: &'a str,
    parameters: &'a [ParameterSpec],
    returns: &'static str,
}

fn render_tree(
    spec: &PluginSpec,
    templates: &LoadedTemplates,
    mut impl_files: BTreeMap<String, Vec<u8>>,
    go_version: &str,
) -> Result<Vec<(PathBuf, Vec<u8>)>> {
    let mut out: Vec<(PathBuf, Vec<u8>)> = Vec::new();

    let mut main = Bindings::new();
    main.set("plugin_id", spec.id.as_str())
        .set("id_literal", go_literal(&spec.id)?)
        .set("name_literal", go_literal(&spec.name)?)
        .set("version_literal", go_literal(&spec.version)?)
        .set("kind_literal", go_literal(spec.kind.as_str())?);
    out.push(("main.go".into(), fill(MAIN_GO, &templates.main_go, &main)));

    for tool in &spec.tools {
        let parameters = serde_json::to_string(&tool.parameters)
            .context("serialize tool parameters")
            .map_err(Error::Generation)?;
        let mut bindings = Bindings::new();
        bindings
            .set("tool_name_literal", go_literal(&tool.name)?)
            .set("description_literal", go_literal(&tool.description)?)
            .set("parameters_literal", go_literal(&parameters)?)
            .set("returns_literal", go_literal(tool.returns.as_str())?);
        out.push((
            tool_go_file(&tool.name).into(),
            fill(TOOL_GO, &templates.tool_go, &bindings),
        ));
    }

    let mut declarations = Vec::new();
    let mut entries = Vec::new();
    for (name, bytes) in payloads(spec)? {
        let embedded = embed(name, &bytes);
        entries.push(format!("\t{}: {},", go_literal(name)?, embedded.ident));
        declarations.push(embedded.declaration);
    }
    let mut resources = Bindings::new();
    resources
        .set("declarations", declarations.join("\n\n"))
        .set("entries", entries.join("\n"));
    out.push((
        "resources.go".into(),
        fill(RESOURCES_GO, &templates.resources_go, &resources),
    ));

    let mut go_mod = Bindings::new();
    go_mod
        .set("module_path", format!("agent_{}", spec.id.replace('-', "_")))
        .set("go_version", go_version);
    out.push(("go.mod".into(), fill(GO_MOD, &templates.go_mod, &go_mod)));

    let config = runtime_config(spec);
    let config_json = serde_json::to_vec(&config)
        .context("serialize runtime config")
        .map_err(Error::Generation)?;
    let mut bootstrap = Bindings::new();
    bootstrap
        .set("plugin_id", spec.id.as_str())
        .set(
            "config_b64",
            base64::engine::general_purpose::STANDARD.encode(config_json),
        );
    let runtime = Path::new(RUNTIME_DIR);
    out.push((
        runtime.join("bootstrap.py"),
        fill(BOOTSTRAP_PY, &templates.bootstrap_py, &bootstrap),
    ));

    let mut requirements = spec.requirement_lines().join("\n");
    if !requirements.is_empty() {
        requirements.push('\n');
    }
    out.push((runtime.join("requirements.txt"), requirements.into_bytes()));

    let tools_dir = runtime.join(TOOLS_PACKAGE);
    out.push((
        tools_dir.join("__init__.py"),
        b"# Code generated by agentc. DO NOT EDIT.\n".to_vec(),
    ));
    for tool in &spec.tools {
        let implementation = match &tool.implementation {
            Implementation::Inline { code } => code.clone(),
            Implementation::File { .. } => {
                format!("from .{}_impl import *  # noqa: F401,F403\n", tool.name)
            }
        };
        let mut bindings = Bindings::new();
        bindings
            .set("tool_name", tool.name.as_str())
            .set("plugin_id", spec.id.as_str())
            .set("implementation", implementation);
        out.push((
            tools_dir.join(format!("{}.py", tool.name)),
            fill(TOOL_PY, &templates.tool_py, &bindings),
        ));
        if let Some(contents) = impl_files.remove(&tool.name) {
            out.push((tools_dir.join(format!("{}_impl.py", tool.name)), contents));
        }
    }

    Ok(out)
}

/// Go source file for a tool.
///
/// The `_gen` suffix keeps names like `check_test` or `run_windows` from
/// turning into filename build constraints.
pub fn tool_go_file(tool: &str) -> String {
    format!("tool_{tool}_gen.go")
}

/// Resource and prompt payloads in declaration order.
pub(crate) fn payloads(spec: &PluginSpec) -> Result<Vec<(&str, Vec<u8>)>> {
    let mut out = Vec::with_capacity(spec.resources.len() + spec.prompts.len());
    for resource in &spec.resources {
        let bytes = resource
            .data
            .bytes()
            .with_context(|| format!("decode resource {}", resource.name))
            .map_err(Error::Generation)?;
        out.push((resource.name.as_str(), bytes));
    }
    for prompt in &spec.prompts {
        out.push((prompt.name.as_str(), prompt.text.as_bytes().to_vec()));
    }
    Ok(out)
}

fn runtime_config(spec: &PluginSpec) -> RuntimeConfig<'_> {
    RuntimeConfig {
        id: &spec.id,
        name: &spec.name,
        version: &spec.version,
        kind: spec.kind.as_str(),
        description: &spec.description,
        instruction: &spec.instruction,
        max_iterations: spec.max_iterations,
        requires_storage: spec.requires_storage,
        can_spawn_children: spec.can_spawn_children,
        tools: spec
            .tools
            .iter()
            .map(|tool| RuntimeTool {
                name: &tool.name,
                description: &tool.description,
                parameters: &tool.parameters,
                returns: tool.returns.as_str(),
            })
            .collect(),
        prompts: spec
            .prompts
            .iter()
            .map(|p| (p.name.as_str(), p.text.as_str()))
            .collect(),
        resources: spec
            .resources
            .iter()
            .map(|r| r.name.as_str())
            .chain(spec.prompts.iter().map(|p| p.name.as_str()))
            .map(|name| (name, ident_for(name)))
            .collect(),
    }
}

fn fill(name: &str, template: &str, bindings: &Bindings) -> Vec<u8> {
    let missing = unbound(template, bindings);
    if !missing.is_empty() {
        warn!(template = name, missing = ?missing, "template placeholders left unbound");
    }
    render(template, bindings).into_bytes()
}

/// Quoted, escaped Go string literal.
fn go_literal(value: &str) -> Result<String> {
    serde_json::to_string(value)
        .context("encode string literal")
        .map_err(Error::Generation)
}

/// Create `agent_{id}_{version}_{timestamp}_{random}`, never reusing an existing directory.
fn create_build_dir(out_dir: &Path, spec: &PluginSpec) -> anyhow::Result<PathBuf> {
    for _ in 0..BUILD_DIR_ATTEMPTS {
        let name = format!(
            "agent_{}_{}_{}_{}",
            spec.id,
            spec.version,
            Utc::now().format("%Y%m%d_%H%M%S"),
            short_id()
        );
        let path = out_dir.join(name);
        match fs::create_dir(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "created build dir");
                return Ok(path);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e).with_context(|| format!("create {}", path.display())),
        }
    }
    Err(anyhow!(
        "could not allocate a unique build dir under {}",
        out_dir.display()
    ))
}

fn short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}

/// Removes a build directory on drop unless disarmed.
#[derive(Debug)]
pub(crate) struct BuildDirGuard {
    path: Option<PathBuf>,
}

impl BuildDirGuard {
    pub(crate) fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub(crate) fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for BuildDirGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take()
            && let Err(err) = fs::remove_dir_all(&path)
        {
            warn!(path = %path.display(), err = %err, "failed to remove build dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::embed::decode;
    use crate::core::spec::{Payload, PromptSpec, ResourceSpec};
    use crate::test_support::{echo_spec, file_tool, inline_tool};

    fn read(tree: &SourceTree, rel: &str) -> String {
        fs::read_to_string(tree.root.join(rel)).expect("read generated file")
    }

    #[test]
    fn renders_identity_into_main() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = generate(&echo_spec(), &TemplateSet::Builtin, temp.path(), temp.path())
            .expect("generate");
        let main = read(&tree, "main.go");
        assert!(main.contains("agentID      = \"echo\""));
        assert!(main.contains("//export AgentManifest"));
        assert!(!main.contains("{{"));
        let tool = read(&tree, "tool_echo_gen.go");
        assert!(tool.contains("Name:        \"echo\""));
    }

    #[test]
    fn embedded_resources_decode_to_original_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = echo_spec();
        spec.resources.push(ResourceSpec {
            name: "logo".into(),
            media_type: Some("image/png".into()),
            data: Payload::Base64("iVBORw0KGgo=".into()),
        });
        spec.prompts.push(PromptSpec {
            name: "system".into(),
            text: "Be brief.".into(),
        });
        let tree = generate(&spec, &TemplateSet::Builtin, temp.path(), temp.path())
            .expect("generate");
        let resources = read(&tree, "resources.go");
        let logo = &resources[resources.find("var res_logo").expect("logo decl")..];
        assert_eq!(
            decode(logo).expect("decode"),
            vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]
        );
        assert!(resources.contains("\t\"system\": res_system,"));
    }

    #[test]
    fn file_implementations_are_copied_verbatim() {
        let temp = tempfile::tempdir().expect("tempdir");
        let source = "def shout(text):\n    return text.upper()  # {{ not a placeholder }}\n";
        fs::create_dir(temp.path().join("tools")).expect("mkdir");
        fs::write(temp.path().join("tools/shout.py"), source).expect("write");
        let mut spec = echo_spec();
        spec.tools.push(file_tool("shout", "tools/shout.py"));

        let out = temp.path().join("out");
        let tree = generate(&spec, &TemplateSet::Builtin, &out, temp.path()).expect("generate");
        assert_eq!(read(&tree, "runtime/agent_tools/shout_impl.py"), source);
        assert!(read(&tree, "runtime/agent_tools/shout.py").contains("from .shout_impl import *"));
        assert!(
            tree.runtime_files()
                .contains(&PathBuf::from("agent_tools/shout_impl.py"))
        );
        assert!(
            tree.runtime_files()
                .contains(&PathBuf::from("agent_tools/__init__.py"))
        );
    }

    #[test]
    fn missing_template_creates_no_directory() {
        let temp = tempfile::tempdir().expect("tempdir");
        let templates = TemplateSet::from_dir(temp.path().join("no-templates"));
        let out = temp.path().join("out");
        let err = generate(&echo_spec(), &templates, &out, temp.path()).unwrap_err();
        assert!(matches!(err, Error::TemplateMissing { .. }));
        assert!(!out.exists());
    }

    #[test]
    fn guard_removes_directory_unless_disarmed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let kept = temp.path().join("kept");
        let dropped = temp.path().join("dropped");
        fs::create_dir(&kept).expect("mkdir");
        fs::create_dir(&dropped).expect("mkdir");
        BuildDirGuard::new(kept.clone()).disarm();
        drop(BuildDirGuard::new(dropped.clone()));
        assert!(kept.exists());
        assert!(!dropped.exists());
    }

    #[test]
    fn requirements_list_pinned_packages() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = echo_spec();
        spec.dependencies.push(crate::core::spec::Dependency {
            name: "requests".into(),
            version: Some("2.32.3".into()),
        });
        let tree = generate(&spec, &TemplateSet::Builtin, temp.path(), temp.path())
            .expect("generate");
        assert_eq!(read(&tree, "runtime/requirements.txt"), "requests==2.32.3\n");
        assert_eq!(read(&tree, "go.mod"), format!("module agent_echo\n\ngo {DEFAULT_GO_VERSION}\n"));
    }

    #[test]
    fn tool_files_never_carry_build_constraints() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = echo_spec();
        spec.tools = ["check_test", "run_windows", "x_arm64", "linux_amd64"]
            .iter()
            .map(|name| inline_tool(name, &format!("def {name}(text):\n    return text\n")))
            .collect();
        let tree = generate(&spec, &TemplateSet::Builtin, temp.path(), temp.path())
            .expect("generate");
        let go_files: Vec<String> = tree
            .go_files()
            .iter()
            .map(|path| path.display().to_string())
            .collect();
        for name in ["check_test", "run_windows", "x_arm64", "linux_amd64"] {
            let file = tool_go_file(name);
            assert!(go_files.contains(&file), "{file} missing from {go_files:?}");
            assert!(file.ends_with("_gen.go"));
        }
        assert!(go_files.iter().all(|file| !file.ends_with("_test.go")));
    }

    #[test]
    fn tools_live_in_their_own_package() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = echo_spec();
        spec.tools = vec![inline_tool("json", "def json(text):\n    return text\n")];
        let tree = generate(&spec, &TemplateSet::Builtin, temp.path(), temp.path())
            .expect("generate");
        let runtime = tree.runtime_files();
        assert!(runtime.contains(&PathBuf::from("agent_tools/json.py")));
        assert!(!runtime.contains(&PathBuf::from("json.py")));
        assert!(read(&tree, "runtime/bootstrap.py").contains("TOOLS_PACKAGE = \"agent_tools\""));
    }
}
