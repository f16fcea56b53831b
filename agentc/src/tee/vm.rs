//! VM isolation: the container contract on a VM-backed OCI runtime.
//!
//! Each container gets its own lightweight guest kernel (Kata Containers by
//! default). Starting prepares the image up front so the first boot is not
//! dominated by a pull, and refuses to fall back to the engine's default
//! runtime when the VM runtime is not registered.

use std::path::Path;

use tracing::{info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::spec::{IsolationLevel, TeeSpec};
use crate::error::{Error, Result};
use crate::io::config::TeeConfig;
use crate::tee::container::{ContainerEngine, ContainerTee};
use crate::tee::{ExecOutput, ExecRequest, Tee};

#[derive(Debug)]
pub struct VmTee {
    inner: ContainerTee,
    runtime: String,
}

impl VmTee {
    pub fn new(spec: TeeSpec, cfg: TeeConfig) -> Self {
        let runtime = cfg.vm_oci_runtime.clone();
        Self {
            inner: ContainerTee::with_runtime(IsolationLevel::Vm, spec, cfg, Some(runtime.clone())),
            runtime,
        }
    }

    pub fn runtime(&self) -> &str {
        &self.runtime
    }

    fn prepare_image(&self) -> Result<()> {
        let image = self.inner.image().to_string();
        if self
            .inner
            .manage(&["image".to_string(), "inspect".to_string(), image.clone()])
            .is_ok()
        {
            return Ok(());
        }
        info!(image = %image, "pulling image for vm isolation");
        self.inner
            .manage(&["pull".to_string(), image])
            .map_err(|e| self.start_error(format!("image preparation failed: {e:#}")))?;
        Ok(())
    }

    fn verify_runtime(&self) -> Result<()> {
        if self.inner.engine() != ContainerEngine::Docker {
            warn!(runtime = %self.runtime, "cannot list runtimes for this engine, relying on run to reject it");
            return Ok(());
        }
        let output = self
            .inner
            .manage(&[
                "info".to_string(),
                "--format".to_string(),
                "{{json .Runtimes}}".to_string(),
            ])
            .map_err(|e| self.start_error(format!("{e:#}")))?;
        if runtime_registered(&output.stdout_lossy(), &self.runtime) {
            Ok(())
        } else {
            Err(self.start_error(format!(
                "OCI runtime {:?} is not registered with docker",
                self.runtime
            )))
        }
    }

    fn start_error(&self, message: String) -> Error {
        Error::TeeStart {
            level: IsolationLevel::Vm,
            message,
        }
    }
}

/// True when `docker info`'s runtime map names `runtime`.
fn runtime_registered(runtimes_json: &str, runtime: &str) -> bool {
    serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(runtimes_json.trim())
        .map(|map| map.contains_key(runtime))
        .unwrap_or(false)
}

impl Tee for VmTee {
    fn level(&self) -> IsolationLevel {
        IsolationLevel::Vm
    }

    #[instrument(skip_all, fields(runtime = %self.runtime))]
    fn start(&mut self) -> Result<()> {
        if self.inner.is_running() {
            return Ok(());
        }
        self.prepare_image()?;
        self.verify_runtime()?;
        self.inner.start()
    }

    fn stop(&mut self) -> Result<()> {
        self.inner.stop()
    }

    fn execute(&self, request: &ExecRequest, cancel: &CancelToken) -> Result<ExecOutput> {
        self.inner.execute(request, cancel)
    }

    fn launch(&mut self, program: &str, args: &[String]) -> Result<()> {
        self.inner.launch(program, args)
    }

    fn interpreter_alive(&mut self) -> bool {
        self.inner.interpreter_alive()
    }

    fn copy_file_in(&self, host: &Path, rel: &Path) -> Result<()> {
        self.inner.copy_file_in(host, rel)
    }

    fn copy_file_out(&self, rel: &Path, host: &Path) -> Result<()> {
        self.inner.copy_file_out(rel, host)
    }

    fn workdir(&self) -> Option<&Path> {
        self.inner.workdir()
    }

    fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}
