//! Request/response types of the interpreter bootstrap protocol.
//!
//! The interpreter serves HTTP/1.0 on a UNIX socket inside the boundary. The
//! host never opens that socket itself: it executes `bootstrap.py call METHOD
//! PATH` through [`crate::tee::Tee::execute`] with the JSON body on stdin, and
//! the call prints one [`CallEnvelope`] line on stdout.

use anyhow::anyhow;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::tee::{ExecOutput, ExecRequest};

/// Entry script of the runtime bundle.
pub const BOOTSTRAP_SCRIPT: &str = "bootstrap.py";

/// Exit code of `bootstrap.py call` when the socket could not be reached.
pub const CALL_UNREACHABLE_EXIT: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// One request to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub method: Method,
    pub path: String,
    pub body: Option<Vec<u8>>,
}

impl Call {
    pub fn health() -> Self {
        Self {
            method: Method::Get,
            path: "/health".to_string(),
            body: None,
        }
    }

    pub fn create_agent() -> Self {
        Self {
            method: Method::Post,
            path: "/create_agent".to_string(),
            body: Some(b"{}".to_vec()),
        }
    }

    pub fn run_agent(agent_id: &str, request: &RunAgentRequest) -> Result<Self> {
        let body = serde_json::to_vec(request)
            .map_err(|e| Error::Transport(anyhow!(e).context("encode run_agent request")))?;
        Ok(Self {
            method: Method::Post,
            path: format!("/run_agent/{agent_id}"),
            body: Some(body),
        })
    }

    /// The `bootstrap.py call` invocation for this request.
    pub fn exec_request(&self, interpreter: &str) -> ExecRequest {
        let request = ExecRequest::new(interpreter).args([
            BOOTSTRAP_SCRIPT,
            "call",
            self.method.as_str(),
            self.path.as_str(),
        ]);
        match &self.body {
            Some(body) => request.stdin(body.clone()),
            None => request,
        }
    }
}

/// What `bootstrap.py call` prints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    pub http_status: u16,
    #[serde(default)]
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CallEnvelope {
    /// Parse the output of a finished call.
    ///
    /// Anything short of an HTTP response from the interpreter is a transport
    /// failure.
    pub fn from_output(output: &ExecOutput) -> Result<Self> {
        let stdout = output.stdout_lossy();
        let line = stdout.lines().rev().find(|line| !line.trim().is_empty());
        let parsed = line.and_then(|line| serde_json::from_str::<CallEnvelope>(line).ok());
        match parsed {
            Some(envelope) if envelope.http_status == 0 => Err(Error::Transport(anyhow!(
                "interpreter unreachable: {}",
                envelope.error.as_deref().unwrap_or("connection failed")
            ))),
            Some(envelope) => Ok(envelope),
            None => Err(Error::Transport(anyhow!(
                "malformed call output (exit {:?}): {}{}",
                output.exit_code,
                stdout.trim(),
                stderr_suffix(output)
            ))),
        }
    }

    /// Decode a successful body, turning `{"status": "error"}` into [`Error::Interpreter`].
    pub fn into_body<T: DeserializeOwned>(self) -> Result<T> {
        if let Some(message) = error_message(&self.body) {
            return Err(Error::Interpreter { message });
        }
        if !(200..300).contains(&self.http_status) {
            return Err(Error::Interpreter {
                message: format!("interpreter answered HTTP {}: {}", self.http_status, self.body),
            });
        }
        serde_json::from_value(self.body)
            .map_err(|e| Error::Transport(anyhow!(e).context("decode interpreter response")))
    }
}

fn error_message(body: &Value) -> Option<String> {
    let object = body.as_object()?;
    if object.get("status").and_then(Value::as_str) != Some("error") {
        return None;
    }
    Some(
        object
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unspecified interpreter error")
            .to_string(),
    )
}

fn stderr_suffix(output: &ExecOutput) -> String {
    let stderr = output.stderr_lossy();
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!("\nstderr:\n{stderr}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub plugin: String,
    #[serde(default)]
    pub agents: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateAgentResponse {
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunAgentRequest {
    pub input: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunAgentResponse {
    pub response: String,
    pub session_id: String,
    #[serde(default)]
    pub turn: u64,
}

/// Structured inference request accepted by the plugin runtime.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl InferenceRequest {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub agent_id: String,
    pub output: String,
    pub session_id: String,
    pub turn: u64,
    pub elapsed_ms: u64,
}
