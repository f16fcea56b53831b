//! Real `go build -buildmode=c-shared` of the echo plugin, then a run.

use std::process::Command;

use agentc::build::{BuildOptions, build};
use agentc::core::cancel::CancelToken;
use agentc::core::platform::TargetPlatform;
use agentc::generate::generate;
use agentc::io::config::{InterpreterConfig, TeeConfig};
use agentc::io::templates::TemplateSet;
use agentc::plugin::{LoadedPlugin, PluginRuntime};
use agentc::test_support::echo_spec;
use tempfile::tempdir;

#[test]
#[ignore]
fn go_toolchain_available() {
    let output = Command::new("go")
        .arg("version")
        .output()
        .expect("go not in PATH");
    assert!(output.status.success());
}

#[test]
#[ignore]
fn echo_plugin_builds_loads_and_runs() {
    let temp = tempdir().expect("tempdir");
    let spec = echo_spec();
    let tree = generate(&spec, &TemplateSet::Builtin, &temp.path().join("src"), temp.path())
        .expect("generate");
    let platform = TargetPlatform::host().expect("host platform");
    let options = BuildOptions::new(temp.path().join("out"));
    let result = build(&tree, &platform, &options, &CancelToken::new()).expect("build");
    assert!(result.success, "toolchain stderr:\n{}", result.stderr);
    let artifact = result.into_artifact().expect("artifact");
    assert!(
        artifact
            .to_string_lossy()
            .ends_with(&format!("agent_echo_1.0.0.{}", platform.extension()))
    );

    let plugin = LoadedPlugin::load(&artifact).expect("load");
    let mut runtime = PluginRuntime::new(InterpreterConfig::default(), TeeConfig::default());
    runtime.initialize(plugin, None).expect("initialize");
    runtime.start(&CancelToken::new()).expect("start");
    let response = runtime
        .run_agent("hello", None, &CancelToken::new())
        .expect("run");
    assert!(response.output.contains("hello"));
    runtime.stop().expect("stop");
}
