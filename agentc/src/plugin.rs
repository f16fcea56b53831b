//! Loading compiled plugins and driving their lifecycle.
//!
//! A [`PluginRuntime`] moves through `Uninitialized → Initialized → Running →
//! Stopped`. Starting it stages the artifact's interpreter bundle inside a
//! [`Tee`], launches the bootstrap, waits for `/health`, and creates the agent.
//! Every request afterwards is one `bootstrap.py call` executed in the
//! boundary.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use serde_json::json;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};

use crate::build::{ArtifactManifest, MANIFEST_FORMAT};
use crate::core::cancel::CancelToken;
use crate::core::embed::ident_for;
use crate::core::lifecycle::{LifecycleState, Operation, next_state};
use crate::core::spec::{PluginSpec, ToolSpec};
use crate::error::{Error, Result, Stage};
use crate::generate::payloads;
use crate::io::config::{InterpreterConfig, TeeConfig};
use crate::io::registry::{AgentRecord, Registry};
use crate::io::spec_store::check_spec;
use crate::protocol::{
    BOOTSTRAP_SCRIPT, Call, CallEnvelope, CreateAgentResponse, HealthResponse, InferenceRequest,
    InferenceResponse, RunAgentRequest, RunAgentResponse,
};
use crate::tee::{ExecRequest, Tee, create_tee};

/// Directory inside the boundary holding staged resources and prompts.
pub const RESOURCE_DIR: &str = "resources";

/// Wall-clock budget of a single health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// A verified artifact with the tables its runtime needs.
#[derive(Debug, Clone)]
pub struct LoadedPlugin {
    artifact: PathBuf,
    manifest: ArtifactManifest,
    bundle: Vec<(PathBuf, Vec<u8>)>,
    tools: BTreeMap<String, ToolSpec>,
    /// Resource and prompt payloads keyed by name.
    resources: BTreeMap<String, Vec<u8>>,
    prompts: BTreeMap<String, String>,
}

impl LoadedPlugin {
    /// Load `artifact` through the sidecar manifest written next to it.
    ///
    /// The manifest's checksum must match the artifact bytes on disk.
    #[instrument(skip_all, fields(artifact = %artifact.display()))]
    pub fn load(artifact: &Path) -> Result<Self> {
        let manifest_path = sidecar_path(artifact).map_err(Error::Build)?;
        let raw = fs::read_to_string(&manifest_path)
            .with_context(|| format!("read manifest {}", manifest_path.display()))
            .map_err(Error::Build)?;
        let manifest: ArtifactManifest = serde_json::from_str(&raw)
            .with_context(|| format!("parse manifest {}", manifest_path.display()))
            .map_err(Error::Build)?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(Error::Build(anyhow!(
                "manifest {} has format {}, expected {MANIFEST_FORMAT}",
                manifest_path.display(),
                manifest.format
            )));
        }
        let bytes = fs::read(artifact)
            .with_context(|| format!("read artifact {}", artifact.display()))
            .map_err(Error::Build)?;
        let actual = hex::encode(Sha256::digest(&bytes));
        if actual != manifest.sha256 {
            return Err(Error::Build(anyhow!(
                "artifact {} does not match its manifest (sha256 {actual}, expected {})",
                artifact.display(),
                manifest.sha256
            )));
        }
        Self::from_manifest(artifact.to_path_buf(), manifest)
    }

    fn from_manifest(artifact: PathBuf, manifest: ArtifactManifest) -> Result<Self> {
        check_spec(&manifest.spec)?;
        let bundle = manifest.runtime_files().map_err(Error::Build)?;
        if !bundle
            .iter()
            .any(|(path, _)| path == Path::new(BOOTSTRAP_SCRIPT))
        {
            return Err(Error::Build(anyhow!(
                "artifact {} carries no {BOOTSTRAP_SCRIPT}",
                artifact.display()
            )));
        }
        let spec = &manifest.spec;
        let tools = spec
            .tools
            .iter()
            .map(|tool| (tool.name.clone(), tool.clone()))
            .collect();
        let resources = payloads(spec)?
            .into_iter()
            .map(|(name, bytes)| (name.to_string(), bytes))
            .collect();
        let prompts = spec
            .prompts
            .iter()
            .map(|prompt| (prompt.name.clone(), prompt.text.clone()))
            .collect();
        debug!(id = %spec.id, files = bundle.len(), "loaded plugin");
        Ok(Self {
            artifact,
            manifest,
            bundle,
            tools,
            resources,
            prompts,
        })
    }

    pub fn spec(&self) -> &PluginSpec {
        &self.manifest.spec
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn manifest(&self) -> &ArtifactManifest {
        &self.manifest
    }

    pub fn tool(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    pub fn resource(&self, name: &str) -> Option<&[u8]> {
        self.resources.get(name).map(Vec::as_slice)
    }

    pub fn prompt(&self, name: &str) -> Option<&str> {
        self.prompts.get(name).map(String::as_str)
    }

    /// Files to place in the boundary's working directory, relative to it.
    fn staged_files(&self) -> Vec<(PathBuf, &[u8])> {
        let bundle = self
            .bundle
            .iter()
            .map(|(path, bytes)| (path.clone(), bytes.as_slice()));
        let resources = self.resources.iter().map(|(name, bytes)| {
            (
                Path::new(RESOURCE_DIR).join(ident_for(name)),
                bytes.as_slice(),
            )
        });
        bundle.chain(resources).collect()
    }

    fn requirements(&self) -> Option<&[u8]> {
        self.bundle
            .iter()
            .find(|(path, _)| path == Path::new("requirements.txt"))
            .map(|(_, bytes)| bytes.as_slice())
            .filter(|bytes| !bytes.iter().all(u8::is_ascii_whitespace))
    }
}

/// `agent_{id}_{version}.manifest.json` beside `agent_{id}_{version}.{ext}`.
fn sidecar_path(artifact: &Path) -> anyhow::Result<PathBuf> {
    let stem = artifact
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| anyhow!("artifact path {} has no file name", artifact.display()))?;
    let name = format!("{stem}.manifest.json");
    Ok(artifact.with_file_name(name))
}

/// One loaded plugin instance and its isolation boundary.
pub struct PluginRuntime {
    interpreter: InterpreterConfig,
    tee_config: TeeConfig,
    state: LifecycleState,
    plugin: Option<LoadedPlugin>,
    tee: Option<Box<dyn Tee>>,
    registry: Option<Arc<Registry>>,
    agent_id: Option<String>,
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("state", &self.state)
            .field("plugin", &self.plugin.as_ref().map(|p| p.spec().id.as_str()))
            .field("agent_id", &self.agent_id)
            .finish_non_exhaustive()
    }
}

impl PluginRuntime {
    pub fn new(interpreter: InterpreterConfig, tee_config: TeeConfig) -> Self {
        Self {
            interpreter,
            tee_config,
            state: LifecycleState::Uninitialized,
            plugin: None,
            tee: None,
            registry: None,
            agent_id: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn plugin(&self) -> Option<&LoadedPlugin> {
        self.plugin.as_ref()
    }

    /// Id assigned by the interpreter once running.
    pub fn agent_id(&self) -> Option<&str> {
        self.agent_id.as_deref()
    }

    fn transition(&self, op: Operation) -> Result<LifecycleState> {
        next_state(self.state, op).ok_or(Error::InvalidState {
            operation: op.as_str(),
            state: self.state,
        })
    }

    /// Bind a loaded plugin and construct (not start) its boundary.
    #[instrument(skip_all, fields(id = %plugin.spec().id))]
    pub fn initialize(&mut self, plugin: LoadedPlugin, registry: Option<Arc<Registry>>) -> Result<()> {
        let next = self.transition(Operation::Initialize)?;
        check_spec(plugin.spec())?;
        self.tee = Some(create_tee(&plugin.spec().tee, &self.tee_config));
        self.plugin = Some(plugin);
        self.registry = registry;
        self.state = next;
        Ok(())
    }

    /// Start the boundary and the interpreter, then create the agent.
    ///
    /// On failure the boundary is stopped again and the runtime stays
    /// initialized.
    #[instrument(skip_all)]
    pub fn start(&mut self, cancel: &CancelToken) -> Result<()> {
        let next = self.transition(Operation::Start)?;
        let (Some(plugin), Some(tee)) = (self.plugin.as_ref(), self.tee.as_mut()) else {
            return Err(Error::InvalidState {
                operation: Operation::Start.as_str(),
                state: self.state,
            });
        };
        let started = Instant::now();
        match boot(plugin, &mut **tee, &self.interpreter, &self.tee_config, cancel) {
            Ok(agent_id) => {
                if let Some(registry) = &self.registry {
                    let spec = plugin.spec();
                    let record = AgentRecord {
                        agent_id: agent_id.clone(),
                        plugin_id: spec.id.clone(),
                        plugin_version: spec.version.clone(),
                        name: spec.name.clone(),
                        kind: spec.kind,
                        isolation: tee.level(),
                        artifact: Some(plugin.artifact().to_path_buf()),
                    };
                    if let Err(err) = registry.register_agent(&record) {
                        stop_quietly(&mut **tee);
                        return Err(err);
                    }
                }
                info!(
                    agent_id = %agent_id,
                    level = %tee.level(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "plugin running"
                );
                self.agent_id = Some(agent_id);
                self.state = next;
                Ok(())
            }
            Err(err) => {
                stop_quietly(&mut **tee);
                Err(err)
            }
        }
    }

    /// Send free text to the agent.
    pub fn run_agent(
        &self,
        input: &str,
        session_id: Option<&str>,
        cancel: &CancelToken,
    ) -> Result<InferenceResponse> {
        let mut request = InferenceRequest::new(input);
        request.session_id = session_id.map(str::to_string);
        self.process_inference(&request, cancel)
    }

    /// One request/response exchange with the running agent.
    #[instrument(skip_all, fields(session = ?request.session_id))]
    pub fn process_inference(
        &self,
        request: &InferenceRequest,
        cancel: &CancelToken,
    ) -> Result<InferenceResponse> {
        self.transition(Operation::Run)?;
        let (Some(tee), Some(agent_id)) = (self.tee.as_ref(), self.agent_id.as_deref()) else {
            return Err(Error::InvalidState {
                operation: Operation::Run.as_str(),
                state: self.state,
            });
        };
        let started = Instant::now();
        let call = Call::run_agent(
            agent_id,
            &RunAgentRequest {
                input: request.input.clone(),
                session_id: request.session_id.clone(),
                parameters: request.parameters.clone(),
            },
        )?;
        let response: RunAgentResponse = exchange(&**tee, &self.interpreter, &call, None, cancel)?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(turn = response.turn, elapsed_ms, "agent responded");

        if let Some(registry) = &self.registry {
            let context_id = format!("{agent_id}:{}", response.session_id);
            let context = json!({
                "agent_id": agent_id,
                "session_id": response.session_id,
                "turn": response.turn,
                "input": request.input,
                "response": response.response,
            });
            if let Err(err) = registry.store_context(&context_id, context) {
                warn!(err = %err, context_id = %context_id, "failed to persist session context");
            }
        }

        Ok(InferenceResponse {
            agent_id: agent_id.to_string(),
            output: response.response,
            session_id: response.session_id,
            turn: response.turn,
            elapsed_ms,
        })
    }

    /// Stop the boundary and release the registry. Idempotent.
    #[instrument(skip_all)]
    pub fn stop(&mut self) -> Result<()> {
        if self.state == LifecycleState::Stopped {
            return Ok(());
        }
        self.state = self.transition(Operation::Stop)?;
        self.registry = None;
        self.agent_id = None;
        if let Some(mut tee) = self.tee.take() {
            tee.stop()?;
        }
        Ok(())
    }
}

impl Drop for PluginRuntime {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!(err = %err, "failed to stop plugin runtime on drop");
        }
    }
}

/// Bring the interpreter up inside `tee` and return the created agent's id.
fn boot(
    plugin: &LoadedPlugin,
    tee: &mut dyn Tee,
    interpreter: &InterpreterConfig,
    tee_config: &TeeConfig,
    cancel: &CancelToken,
) -> Result<String> {
    tee.start()?;
    stage(plugin, tee)?;
    install_packages(plugin, tee, interpreter, tee_config, cancel)?;
    tee.launch(
        &interpreter.command,
        &[BOOTSTRAP_SCRIPT.to_string(), "serve".to_string()],
    )?;
    wait_healthy(tee, interpreter, cancel)?;
    let created: CreateAgentResponse =
        exchange(tee, interpreter, &Call::create_agent(), None, cancel)?;
    Ok(created.agent_id)
}

/// Copy the bundle and resources into the boundary through a host staging dir.
fn stage(plugin: &LoadedPlugin, tee: &dyn Tee) -> Result<()> {
    let staging = TempDir::new()
        .context("create staging dir")
        .map_err(Error::Isolation)?;
    for (rel, bytes) in plugin.staged_files() {
        let host = staging.path().join(&rel);
        if let Some(parent) = host.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))
                .map_err(Error::Isolation)?;
        }
        fs::write(&host, bytes)
            .with_context(|| format!("write {}", host.display()))
            .map_err(Error::Isolation)?;
        tee.copy_file_in(&host, &rel)?;
    }
    Ok(())
}

fn install_packages(
    plugin: &LoadedPlugin,
    tee: &dyn Tee,
    interpreter: &InterpreterConfig,
    tee_config: &TeeConfig,
    cancel: &CancelToken,
) -> Result<()> {
    if plugin.requirements().is_none() {
        return Ok(());
    }
    if !interpreter.pip_install {
        debug!("package install disabled, expecting preinstalled packages");
        return Ok(());
    }
    if !plugin.spec().tee.network_access {
        warn!("plugin declares packages but network access is denied, skipping install");
        return Ok(());
    }
    let request = ExecRequest::new(interpreter.command.as_str())
        .args([
            "-m",
            "pip",
            "install",
            "--quiet",
            "--disable-pip-version-check",
            "--target",
            "deps",
            "-r",
            "requirements.txt",
        ])
        .timeout(Duration::from_secs(tee_config.management_timeout_secs));
    let output = tee.execute(&request, cancel)?;
    if !output.success() {
        return Err(Error::Interpreter {
            message: format!(
                "package install failed (exit {:?}):\n{}",
                output.exit_code,
                output.stderr_lossy()
            ),
        });
    }
    info!("installed interpreter packages");
    Ok(())
}

/// Poll `/health` a fixed number of times with a fixed pause between attempts.
fn wait_healthy(tee: &mut dyn Tee, interpreter: &InterpreterConfig, cancel: &CancelToken) -> Result<()> {
    let attempts = interpreter.health_attempts.max(1);
    let backoff = Duration::from_millis(interpreter.health_backoff_ms);
    let mut last_error = String::from("no attempt made");
    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                stage: Stage::Interpreter,
            });
        }
        if !tee.interpreter_alive() {
            return Err(Error::Interpreter {
                message: format!(
                    "interpreter exited during startup (see {})",
                    crate::tee::INTERPRETER_LOG
                ),
            });
        }
        match exchange::<HealthResponse>(
            tee,
            interpreter,
            &Call::health(),
            Some(HEALTH_CHECK_TIMEOUT),
            cancel,
        ) {
            Ok(health) if health.status == "ok" => {
                debug!(attempt, plugin = %health.plugin, "interpreter healthy");
                return Ok(());
            }
            Ok(health) => last_error = format!("health status {:?}", health.status),
            Err(err @ Error::Cancelled { .. }) => return Err(err),
            Err(err) => last_error = err.to_string(),
        }
        debug!(attempt, backoff_ms = backoff.as_millis() as u64, error = %last_error, "interpreter not ready");
        if attempt < attempts {
            sleep_cancellable(backoff, cancel)?;
        }
    }
    Err(Error::Interpreter {
        message: format!("interpreter not healthy after {attempts} attempts: {last_error}"),
    })
}

fn exchange<T: serde::de::DeserializeOwned>(
    tee: &dyn Tee,
    interpreter: &InterpreterConfig,
    call: &Call,
    timeout: Option<Duration>,
    cancel: &CancelToken,
) -> Result<T> {
    let mut request = call.exec_request(&interpreter.command);
    request.timeout = timeout;
    let output = tee.execute(&request, cancel)?;
    CallEnvelope::from_output(&output)?.into_body()
}

fn sleep_cancellable(total: Duration, cancel: &CancelToken) -> Result<()> {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                stage: Stage::Interpreter,
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}

fn stop_quietly(tee: &mut dyn Tee) {
    if let Err(err) = tee.stop() {
        warn!(err = %err, "failed to stop isolation boundary after startup failure");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::build::{BuildOptions, build};
    use crate::core::platform::{TargetPlatform, manifest_name};
    use crate::core::spec::IsolationLevel;
    use crate::generate::generate;
    use crate::io::templates::TemplateSet;
    use crate::tee::ExecOutput;
    use crate::test_support::{FAKE_GO_OK, echo_spec, fake_toolchain};
    use tempfile::tempdir;

    fn built_echo(dir: &Path) -> PathBuf {
        let tree = generate(&echo_spec(), &TemplateSet::Builtin, &dir.join("gen"), dir)
            .expect("generate");
        let mut options = BuildOptions::new(dir.join("out"));
        options.command = vec![fake_toolchain(dir, FAKE_GO_OK).display().to_string()];
        let platform: TargetPlatform = "linux/amd64".parse().expect("platform");
        build(&tree, &platform, &options, &CancelToken::new())
            .expect("build")
            .into_artifact()
            .expect("artifact")
    }

    #[test]
    fn loads_verified_artifact() {
        let dir = tempdir().expect("tempdir");
        let artifact = built_echo(dir.path());
        let plugin = LoadedPlugin::load(&artifact).expect("load");
        assert_eq!(plugin.spec().id, "echo");
        assert!(plugin.tool("echo").is_some());
        let staged: Vec<PathBuf> = plugin.staged_files().into_iter().map(|(p, _)| p).collect();
        assert!(staged.contains(&PathBuf::from("bootstrap.py")));
        assert!(staged.contains(&PathBuf::from("agent_tools/echo.py")));
        assert_eq!(
            sidecar_path(&artifact).expect("sidecar"),
            dir.path().join("out").join(manifest_name("echo", "1.0.0"))
        );
    }

    #[test]
    fn tampered_artifact_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let artifact = built_echo(dir.path());
        fs::write(&artifact, b"something else").expect("tamper");
        let err = LoadedPlugin::load(&artifact).expect_err("checksum mismatch");
        assert!(err.to_string().contains("does not match its manifest"));
    }

    #[test]
    fn lifecycle_is_enforced() {
        let dir = tempdir().expect("tempdir");
        let plugin = LoadedPlugin::load(&built_echo(dir.path())).expect("load");
        let mut runtime = PluginRuntime::new(InterpreterConfig::default(), TeeConfig::default());
        let cancel = CancelToken::new();

        let err = runtime.run_agent("hello", None, &cancel).expect_err("not running");
        assert!(matches!(err, Error::InvalidState { .. }));

        runtime.initialize(plugin.clone(), None).expect("initialize");
        assert_eq!(runtime.state(), LifecycleState::Initialized);
        let err = runtime.initialize(plugin, None).expect_err("second initialize");
        assert!(matches!(err, Error::InvalidState { .. }));

        runtime.stop().expect("stop");
        runtime.stop().expect("stop again");
        assert_eq!(runtime.state(), LifecycleState::Stopped);
        assert!(runtime.start(&cancel).is_err());
    }

    /// Boundary whose interpreter never answers; records when each call ran.
    #[derive(Debug, Default)]
    struct SilentTee {
        calls: std::sync::Mutex<Vec<Instant>>,
    }

    impl Tee for SilentTee {
        fn level(&self) -> IsolationLevel {
            IsolationLevel::Process
        }

        fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn stop(&mut self) -> Result<()> {
            Ok(())
        }

        fn execute(&self, _request: &ExecRequest, _cancel: &CancelToken) -> Result<ExecOutput> {
            self.calls.lock().expect("calls").push(Instant::now());
            Ok(ExecOutput {
                stdout: br#"{"http_status": 0, "body": null, "error": "connection refused"}"#.to_vec(),
                stderr: Vec::new(),
                exit_code: Some(crate::protocol::CALL_UNREACHABLE_EXIT),
                elapsed: Duration::ZERO,
            })
        }

        fn launch(&mut self, _program: &str, _args: &[String]) -> Result<()> {
            Ok(())
        }

        fn interpreter_alive(&mut self) -> bool {
            true
        }

        fn copy_file_in(&self, _host: &Path, _rel: &Path) -> Result<()> {
            Ok(())
        }

        fn copy_file_out(&self, _rel: &Path, _host: &Path) -> Result<()> {
            Ok(())
        }

        fn workdir(&self) -> Option<&Path> {
            None
        }

        fn is_running(&self) -> bool {
            true
        }
    }

    #[test]
    fn health_polling_uses_a_fixed_interval() {
        let interpreter = InterpreterConfig {
            health_attempts: 4,
            health_backoff_ms: 50,
            ..InterpreterConfig::default()
        };
        let mut tee = SilentTee::default();
        let err = wait_healthy(&mut tee, &interpreter, &CancelToken::new()).expect_err("never healthy");
        assert!(err.to_string().contains("after 4 attempts"), "{err}");

        let calls = tee.calls.lock().expect("calls").clone();
        assert_eq!(calls.len(), 4);
        for pair in calls.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(
                gap >= Duration::from_millis(50) && gap < Duration::from_millis(95),
                "gap {gap:?}"
            );
        }
    }

    #[test]
    fn failed_start_stays_initialized() {
        let dir = tempdir().expect("tempdir");
        let plugin = LoadedPlugin::load(&built_echo(dir.path())).expect("load");
        let interpreter = InterpreterConfig {
            command: "/nonexistent/agentc-python".to_string(),
            health_attempts: 2,
            health_backoff_ms: 10,
            ..InterpreterConfig::default()
        };
        let mut runtime = PluginRuntime::new(interpreter, TeeConfig::default());
        runtime.initialize(plugin, None).expect("initialize");
        assert!(runtime.start(&CancelToken::new()).is_err());
        assert_eq!(runtime.state(), LifecycleState::Initialized);
        assert!(runtime.agent_id().is_none());
    }
}
