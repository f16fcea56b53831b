//! Code template lookup: built-in copies or a user-supplied directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Template names, one `<name>.tmpl` file each.
pub const MAIN_GO: &str = "main.go";
pub const TOOL_GO: &str = "tool.go";
pub const RESOURCES_GO: &str = "resources.go";
pub const GO_MOD: &str = "go.mod";
pub const BOOTSTRAP_PY: &str = "bootstrap.py";
pub const TOOL_PY: &str = "tool.py";

pub const TEMPLATE_NAMES: [&str; 6] = [MAIN_GO, TOOL_GO, RESOURCES_GO, GO_MOD, BOOTSTRAP_PY, TOOL_PY];

const BUILTIN: [(&str, &str); 6] = [
    (MAIN_GO, include_str!("../../templates/main.go.tmpl")),
    (TOOL_GO, include_str!("../../templates/tool.go.tmpl")),
    (RESOURCES_GO, include_str!("../../templates/resources.go.tmpl")),
    (GO_MOD, include_str!("../../templates/go.mod.tmpl")),
    (BOOTSTRAP_PY, include_str!("../../templates/bootstrap.py.tmpl")),
    (TOOL_PY, include_str!("../../templates/tool.py.tmpl")),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSet {
    /// Templates compiled into the binary.
    Builtin,
    /// `<dir>/<name>.tmpl`; every template must exist there.
    Dir(PathBuf),
}

impl TemplateSet {
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        TemplateSet::Dir(dir.into())
    }

    /// `Dir` when a directory is configured, `Builtin` otherwise.
    pub fn from_config(dir: Option<&Path>) -> Self {
        dir.map_or(TemplateSet::Builtin, |dir| TemplateSet::Dir(dir.to_path_buf()))
    }

    /// Template text for `name`. A missing file is fatal: no fallback to built-ins.
    pub fn load(&self, name: &str) -> Result<String> {
        match self {
            TemplateSet::Builtin => BUILTIN
                .iter()
                .find(|(builtin, _)| *builtin == name)
                .map(|(_, text)| (*text).to_string())
                .ok_or_else(|| Error::TemplateMissing {
                    name: name.to_string(),
                    path: PathBuf::from(format!("<builtin>/{name}.tmpl")),
                }),
            TemplateSet::Dir(dir) => {
                let path = dir.join(format!("{name}.tmpl"));
                fs::read_to_string(&path).map_err(|_| Error::TemplateMissing {
                    name: name.to_string(),
                    path,
                })
            }
        }
    }
}

/// Copy the built-in templates into `dir` as a starting point for overrides.
pub fn export_builtin(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    use anyhow::Context as _;
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let mut written = Vec::new();
    for (name, text) in BUILTIN {
        let path = dir.join(format!("{name}.tmpl"));
        fs::write(&path, text).with_context(|| format!("write {}", path.display()))?;
        written.push(path);
    }
    Ok(written)
}
