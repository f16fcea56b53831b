//! The interpreter bootstrap served from a scripted-toolchain artifact.
//!
//! The artifact bytes are fake, but the manifest carries the real runtime
//! bundle, so the full start → health → create → run path is exercised.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use agentc::build::{BuildOptions, build};
use agentc::core::cancel::CancelToken;
use agentc::core::lifecycle::LifecycleState;
use agentc::core::platform::TargetPlatform;
use agentc::core::spec::{PluginKind, PluginSpec};
use agentc::error::Error;
use agentc::generate::generate;
use agentc::io::config::{InterpreterConfig, TeeConfig};
use agentc::io::registry::Registry;
use agentc::io::templates::TemplateSet;
use agentc::plugin::{LoadedPlugin, PluginRuntime};
use agentc::protocol::InferenceRequest;
use agentc::test_support::{FAKE_GO_OK, echo_spec, fake_toolchain, inline_tool};
use tempfile::tempdir;

fn artifact_for(spec: &PluginSpec, dir: &Path) -> PathBuf {
    let tree = generate(spec, &TemplateSet::Builtin, &dir.join("src"), dir).expect("generate");
    let mut options = BuildOptions::new(dir.join("out"));
    options.command = vec![fake_toolchain(dir, FAKE_GO_OK).display().to_string()];
    let platform = TargetPlatform::host().expect("host platform");
    build(&tree, &platform, &options, &CancelToken::new())
        .expect("build")
        .into_artifact()
        .expect("artifact")
}

fn running(spec: &PluginSpec, dir: &Path, registry: Option<Arc<Registry>>) -> PluginRuntime {
    let plugin = LoadedPlugin::load(&artifact_for(spec, dir)).expect("load");
    let mut runtime = PluginRuntime::new(InterpreterConfig::default(), TeeConfig::default());
    runtime.initialize(plugin, registry).expect("initialize");
    runtime.start(&CancelToken::new()).expect("start");
    runtime
}

#[test]
#[ignore]
fn echo_agent_answers_and_records_context() {
    let temp = tempdir().expect("tempdir");
    let registry = Arc::new(Registry::open(temp.path().join("registry")).expect("registry"));
    let mut runtime = running(&echo_spec(), temp.path(), Some(Arc::clone(&registry)));
    assert_eq!(runtime.state(), LifecycleState::Running);
    let agent_id = runtime.agent_id().expect("agent id").to_string();
    assert!(registry.get_agent(&agent_id).expect("get").is_some());

    let cancel = CancelToken::new();
    let first = runtime.run_agent("hello", Some("s1"), &cancel).expect("run");
    assert!(first.output.contains("hello"));
    assert_eq!(first.session_id, "s1");
    assert_eq!(first.turn, 1);
    let second = runtime.run_agent("again", Some("s1"), &cancel).expect("run");
    assert_eq!(second.turn, 2);

    let context = registry
        .get_context(&format!("{agent_id}:s1"))
        .expect("context")
        .expect("stored");
    assert_eq!(context["response"], "again");

    runtime.stop().expect("stop");
    assert_eq!(runtime.state(), LifecycleState::Stopped);
}

#[test]
#[ignore]
fn direct_tool_calls_and_application_errors() {
    let temp = tempdir().expect("tempdir");
    let mut spec = echo_spec();
    spec.kind = PluginKind::Sequential;
    spec.tools.push(inline_tool(
        "shout",
        "def shout(text):\n    if not text:\n        raise ValueError('nothing to shout')\n    return text.upper() + '!'\n",
    ));
    let runtime = running(&spec, temp.path(), None);
    let cancel = CancelToken::new();

    let chained = runtime.run_agent("hi", None, &cancel).expect("chain");
    assert_eq!(chained.output, "HI!");

    let direct = runtime
        .process_inference(
            &InferenceRequest::new(r#"{"tool": "echo", "args": {"text": "raw"}}"#),
            &cancel,
        )
        .expect("direct");
    assert_eq!(direct.output, "raw");

    let err = runtime.run_agent("", None, &cancel).expect_err("tool raised");
    match err {
        Error::Interpreter { message } => assert!(message.contains("nothing to shout"), "{message}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
#[ignore]
fn tools_named_after_stdlib_modules_still_load() {
    let temp = tempdir().expect("tempdir");
    let mut spec = echo_spec();
    spec.tools = vec![inline_tool(
        "json",
        "import json as _json\n\ndef json(text):\n    return _json.dumps({'got': text})\n",
    )];
    let runtime = running(&spec, temp.path(), None);
    let response = runtime
        .run_agent("x", None, &CancelToken::new())
        .expect("run");
    assert_eq!(response.output, r#"{"got": "x"}"#);
}
