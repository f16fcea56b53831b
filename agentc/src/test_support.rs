//! Test-only helpers for constructing plugin specs and fake toolchains.

use std::fs;
use std::path::{Path, PathBuf};

use crate::core::spec::{
    Implementation, ParameterSpec, PluginKind, PluginSpec, TeeSpec, ToolSpec, ValueType,
};

/// Toolchain stand-in that honours `-o`, reports its target, and writes a fixed artifact.
pub const FAKE_GO_OK: &str = r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
echo "building for $GOOS/$GOARCH cgo=$CGO_ENABLED"
echo "compiling package main" >&2
test -f main.go || { echo "main.go missing" >&2; exit 2; }
printf 'fake-shared-object' > "$out"
"#;

/// Toolchain stand-in that fails like a syntax error.
pub const FAKE_GO_FAIL: &str = r#"echo "main.go:1:1: expected 'package'" >&2
exit 1
"#;

/// Single-tool plugin whose `echo` tool returns its `text` argument.
pub fn echo_spec() -> PluginSpec {
    PluginSpec {
        id: "echo".to_string(),
        name: "Echo".to_string(),
        version: "1.0.0".to_string(),
        kind: PluginKind::SingleModel,
        description: "Repeats its input".to_string(),
        instruction: "Return the input unchanged.".to_string(),
        tools: vec![inline_tool("echo", "def echo(text):\n    return text\n")],
        resources: Vec::new(),
        prompts: Vec::new(),
        dependencies: Vec::new(),
        requires_storage: false,
        can_spawn_children: false,
        max_iterations: 3,
        tee: TeeSpec::default(),
    }
}

/// Tool taking one required string `text`, implemented inline.
pub fn inline_tool(name: &str, code: &str) -> ToolSpec {
    tool(
        name,
        Implementation::Inline {
            code: code.to_string(),
        },
    )
}

/// Tool taking one required string `text`, implemented by a file on disk.
pub fn file_tool(name: &str, path: impl Into<PathBuf>) -> ToolSpec {
    tool(name, Implementation::File { path: path.into() })
}

fn tool(name: &str, implementation: Implementation) -> ToolSpec {
    ToolSpec {
        name: name.to_string(),
        description: format!("{name} tool"),
        parameters: vec![text_param()],
        returns: ValueType::String,
        implementation,
    }
}

fn text_param() -> ParameterSpec {
    ParameterSpec {
        name: "text".to_string(),
        ty: ValueType::String,
        required: true,
        default: None,
        properties: Vec::new(),
        items: None,
    }
}

/// Write an executable `/bin/sh` script named `fake-go` under `dir`.
#[cfg(unix)]
pub fn fake_toolchain(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-go");
    fs::write(&path, format!("#!/bin/sh\n{body}")).expect("write fake toolchain");
    let mut perms = fs::metadata(&path).expect("stat fake toolchain").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("chmod fake toolchain");
    path
}
