//! Spec → source tree → artifact, driven through the public API with a
//! scripted toolchain.

use std::fs;
use std::path::{Path, PathBuf};

use agentc::core::spec::{Payload, PromptSpec, ResourceSpec};
use agentc::error::{Error, Stage};
use agentc::generate::generate;
use agentc::io::spec_store::parse_spec;
use agentc::io::templates::TemplateSet;
use agentc::test_support::{echo_spec, file_tool, inline_tool};
use tempfile::tempdir;

fn entries(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(entries) => entries.map(|e| e.expect("entry").path()).collect(),
        Err(_) => Vec::new(),
    }
}

#[test]
fn one_go_file_per_tool_plus_main_and_resources() {
    let temp = tempdir().expect("tempdir");
    let mut spec = echo_spec();
    spec.tools.push(inline_tool("reverse", "def reverse(text):\n    return text[::-1]\n"));
    spec.resources.push(ResourceSpec {
        name: "greeting".into(),
        media_type: Some("text/plain".into()),
        data: Payload::Text("hello\n".into()),
    });
    spec.prompts.push(PromptSpec {
        name: "system".into(),
        text: "You echo.".into(),
    });

    let tree = generate(&spec, &TemplateSet::Builtin, temp.path(), temp.path()).expect("generate");
    let mut go_files: Vec<String> = tree
        .go_files()
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    go_files.sort();
    assert_eq!(
        go_files,
        vec!["main.go", "resources.go", "tool_echo_gen.go", "tool_reverse_gen.go"]
    );
    assert!(tree.root.join("go.mod").is_file());
    assert!(tree.root.join("runtime/bootstrap.py").is_file());
}

#[test]
fn duplicate_tool_names_write_nothing() {
    let temp = tempdir().expect("tempdir");
    let out = temp.path().join("out");
    let mut spec = echo_spec();
    spec.tools.push(inline_tool("echo", "def echo(text):\n    return text\n"));

    let err = generate(&spec, &TemplateSet::Builtin, &out, temp.path()).expect_err("duplicate");
    assert!(matches!(err, Error::SpecValidation(_)));
    assert_eq!(err.stage(), Stage::Validation);
    assert!(entries(&out).is_empty());
}

#[test]
fn repeated_generation_never_reuses_a_directory() {
    let temp = tempdir().expect("tempdir");
    let platform = "darwin/arm64".parse().expect("platform");
    let first = generate(&echo_spec(), &TemplateSet::Builtin, temp.path(), temp.path())
        .expect("first");
    let second = generate(&echo_spec(), &TemplateSet::Builtin, temp.path(), temp.path())
        .expect("second");
    assert_ne!(first.root, second.root);
    assert_eq!(first.artifact_name(&platform), "agent_echo_1.0.0.dylib");
    assert_eq!(first.artifact_name(&platform), second.artifact_name(&platform));
}

#[test]
fn missing_tool_file_names_tool_and_path_and_leaves_nothing() {
    let temp = tempdir().expect("tempdir");
    let out = temp.path().join("out");
    let mut spec = echo_spec();
    spec.tools.push(file_tool("lookup", "tools/lookup.py"));

    let err = generate(&spec, &TemplateSet::Builtin, &out, temp.path()).expect_err("missing file");
    match &err {
        Error::ToolFileMissing { tool, path } => {
            assert_eq!(tool, "lookup");
            assert!(path.ends_with("tools/lookup.py"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(err.stage(), Stage::Generation);
    let message = err.to_string();
    assert!(message.contains("lookup") && message.contains("tools/lookup.py"));
    assert!(entries(&out).is_empty());
}

#[test]
fn unknown_spec_fields_are_rejected_up_front() {
    let mut value = serde_json::to_value(echo_spec()).expect("json");
    value["tools"][0]["timeout"] = serde_json::json!(5);
    let err = parse_spec(&value.to_string()).expect_err("unknown field");
    assert!(matches!(err, Error::SpecValidation(_)));
}

#[cfg(unix)]
mod with_fake_toolchain {
    use super::*;
    use agentc::build::{BuildOptions, build};
    use agentc::core::cancel::CancelToken;
    use agentc::core::platform::TargetPlatform;
    use agentc::io::process::OutputLine;
    use agentc::plugin::LoadedPlugin;
    use agentc::test_support::{FAKE_GO_FAIL, FAKE_GO_OK, fake_toolchain};
    use std::sync::mpsc;

    fn options(temp: &Path, script: &str) -> BuildOptions {
        let mut options = BuildOptions::new(temp.join("artifacts"));
        options.command = vec![fake_toolchain(temp, script).display().to_string()];
        options
    }

    #[test]
    fn build_streams_progress_and_loads() {
        let temp = tempdir().expect("tempdir");
        let tree = generate(&echo_spec(), &TemplateSet::Builtin, &temp.path().join("src"), temp.path())
            .expect("generate");
        let platform: TargetPlatform = "linux/arm64".parse().expect("platform");
        let (tx, rx) = mpsc::channel::<OutputLine>();
        let mut opts = options(temp.path(), FAKE_GO_OK);
        opts.progress = Some(tx);

        let result = build(&tree, &platform, &opts, &CancelToken::new()).expect("build");
        drop(opts);
        let lines: Vec<String> = rx.iter().map(|line| line.line).collect();
        assert!(lines.iter().any(|l| l == "building for linux/arm64 cgo=1"), "{lines:?}");
        assert!(lines.iter().any(|l| l == "compiling package main"), "{lines:?}");

        assert!(result.success);
        let artifact = result.into_artifact().expect("artifact");
        assert_eq!(
            artifact.file_name().and_then(|n| n.to_str()),
            Some("agent_echo_1.0.0.so")
        );
        let plugin = LoadedPlugin::load(&artifact).expect("load");
        assert_eq!(plugin.spec(), &echo_spec());
        assert_eq!(plugin.manifest().platform, "linux/arm64");
    }

    #[test]
    fn toolchain_failure_is_a_result_not_an_error() {
        let temp = tempdir().expect("tempdir");
        let tree = generate(&echo_spec(), &TemplateSet::Builtin, &temp.path().join("src"), temp.path())
            .expect("generate");
        let platform = TargetPlatform::host().expect("host");
        let result = build(&tree, &platform, &options(temp.path(), FAKE_GO_FAIL), &CancelToken::new())
            .expect("build ran");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.artifact.is_none());
        assert!(!tree.root.exists());

        let err = result.into_artifact().expect_err("toolchain error");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("main.go:1:1: expected 'package'"));
    }
}
