use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::types::E2bConfig;
use crate::error::{CodeletError, Result};
use crate::sandbox::traits::{BackendKind, ConnectionState, SandboxBackend, SandboxInfo};
use crate::sandbox::{ErrorInfo, PayloadKind, RawExecResult, RawValue};

const BACKEND_NAME: &str = "e2b";

/// Port the code interpreter listens on inside every sandbox.
const INTERPRETER_PORT: u16 = 49999;

/// A running E2B sandbox.
#[derive(Debug, Clone)]
struct SandboxSession {
    sandbox_id: String,
    access_token: Option<String>,
    execute_url: String,
}

/// E2B cloud sandbox backend.
///
/// Each backend owns one remote sandbox whose code-interpreter kernel keeps
/// state between `/execute` calls.
pub struct E2bBackend {
    client: Client,
    config: E2bConfig,
    api_key: String,
    session: Mutex<Option<SandboxSession>>,
    installed_packages: Mutex<Vec<String>>,
    state: Mutex<ConnectionState>,
}

impl E2bBackend {
    /// Create a sandbox from the configured template and install `packages`.
    ///
    /// The sandbox is killed again if installation fails.
    pub async fn provision(config: E2bConfig, packages: &[String]) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            CodeletError::provision(
                BACKEND_NAME,
                format!(
                    "API key not found (set e2b.api_key or {})",
                    E2bConfig::API_KEY_ENV
                ),
            )
        })?;

        let mut builder = Client::builder();
        if let Some(seconds) = config.request_timeout_seconds {
            builder = builder.timeout(Duration::from_secs(seconds));
        }
        let client = builder.build().map_err(|e| {
            CodeletError::provision(BACKEND_NAME, format!("Failed to create HTTP client: {}", e))
        })?;

        let backend = Self {
            client,
            config,
            api_key,
            session: Mutex::new(None),
            installed_packages: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Uninitialized),
        };

        let setup = async {
            backend.create_sandbox().await?;
            backend.install_packages(packages).await
        };

        if let Err(e) = setup.await {
            if let Err(cleanup) = backend.terminate().await {
                warn!(error = %cleanup, "Failed to clean up after provisioning error");
            }
            return Err(e);
        }

        Ok(backend)
    }

    /// Whether an API key is configured; the service itself is not contacted.
    pub fn is_available(config: &E2bConfig) -> bool {
        config.resolve_api_key().is_some()
    }

    async fn create_sandbox(&self) -> Result<()> {
        let url = format!("{}/sandboxes", self.config.api_url.trim_end_matches('/'));
        let request = CreateSandboxRequest {
            template_id: self.config.template.clone(),
            timeout: self.config.sandbox_timeout_seconds,
        };

        info!(template = %self.config.template, "Creating E2B sandbox...");

        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                CodeletError::provision(BACKEND_NAME, format!("Failed to reach E2B: {}", e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(CodeletError::provision(
                BACKEND_NAME,
                format!("Sandbox creation failed (HTTP {}): {}", status, error_text),
            ));
        }

        let created: CreatedSandbox = response.json().await.map_err(|e| {
            CodeletError::provision(BACKEND_NAME, format!("Unexpected E2B response: {}", e))
        })?;

        let domain = created
            .domain
            .clone()
            .unwrap_or_else(|| self.config.domain.clone());
        let session = SandboxSession {
            execute_url: format!(
                "https://{}-{}.{}/execute",
                INTERPRETER_PORT, created.sandbox_id, domain
            ),
            sandbox_id: created.sandbox_id,
            access_token: created.envd_access_token,
        };

        info!(sandbox_id = %session.sandbox_id, "E2B sandbox created");

        if let Ok(mut lock) = self.session.lock() {
            *lock = Some(session);
        }
        self.set_state(ConnectionState::Running);
        Ok(())
    }

    fn current_session(&self) -> Option<SandboxSession> {
        self.session.lock().ok().and_then(|guard| guard.clone())
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut lock) = self.state.lock() {
            *lock = state;
        }
    }

    async fn kill_sandbox(&self, sandbox_id: &str) -> Result<()> {
        let url = format!(
            "{}/sandboxes/{}",
            self.config.api_url.trim_end_matches('/'),
            sandbox_id
        );

        let response = self
            .client
            .delete(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            info!(sandbox_id = %sandbox_id, "E2B sandbox killed");
            return Ok(());
        }

        let error_text = response.text().await.unwrap_or_default();
        Err(CodeletError::SandboxCommunication(format!(
            "Failed to kill sandbox {} (HTTP {}): {}",
            sandbox_id, status, error_text
        )))
    }
}

/// Python that installs `packages` with pip and raises if pip fails.
fn pip_install_snippet(packages: &[String]) -> Result<String> {
    Ok(format!(
        "import subprocess as _codelet_sp, sys as _codelet_sys\n\
         _codelet_pip = _codelet_sp.run([_codelet_sys.executable, '-m', 'pip', 'install', '--quiet', *{}], capture_output=True, text=True)\n\
         if _codelet_pip.returncode != 0:\n    raise RuntimeError(_codelet_pip.stderr)\n\
         del _codelet_sp, _codelet_sys, _codelet_pip\n",
        serde_json::to_string(packages)?
    ))
}

/// Fold the NDJSON event stream returned by `/execute` into one result.
fn fold_execution_stream(body: &str) -> Result<RawExecResult> {
    let mut result = RawExecResult::default();

    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let event: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            CodeletError::SandboxCommunication(format!("Malformed execution event: {}", e))
        })?;
        let event_type = event
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        match event_type.as_str() {
            "stdout" => {
                let stream: StreamText = serde_json::from_value(event)?;
                result.stdout.push_str(&stream.text);
            }
            "stderr" => {
                let stream: StreamText = serde_json::from_value(event)?;
                debug!(text = %stream.text.trim_end(), "Sandbox stderr");
            }
            "result" => {
                let output: ExecutionOutput = serde_json::from_value(event)?;
                if output.is_main_result {
                    result.result = output.into_raw_value();
                }
            }
            "error" => {
                let error: ExecutionError = serde_json::from_value(event)?;
                result.error = Some(ErrorInfo::from_exception(
                    error.name,
                    error.value,
                    error.traceback,
                ));
            }
            other => debug!(event_type = %other, "Ignoring execution event"),
        }
    }

    Ok(result)
}

#[async_trait]
impl SandboxBackend for E2bBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn kind(&self) -> BackendKind {
        BackendKind::CloudSandbox
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ConnectionState::Terminated)
    }

    async fn install_packages(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        info!(packages = ?packages, "Installing packages in E2B sandbox");

        let raw = self.run_snippet(&pip_install_snippet(packages)?).await?;
        if let Some(error) = raw.error {
            return Err(CodeletError::provision(
                BACKEND_NAME,
                format!(
                    "pip install {} failed: {}",
                    packages.join(" "),
                    error.message.trim()
                ),
            ));
        }

        if let Ok(mut installed) = self.installed_packages.lock() {
            installed.extend(packages.iter().cloned());
        }
        Ok(())
    }

    async fn run_snippet(&self, code: &str) -> Result<RawExecResult> {
        if self.state() != ConnectionState::Running {
            return Err(CodeletError::UseAfterTermination);
        }
        let session = self
            .current_session()
            .ok_or(CodeletError::UseAfterTermination)?;

        let mut request = self
            .client
            .post(&session.execute_url)
            .json(&ExecuteRequest { code });
        if let Some(token) = &session.access_token {
            request = request.header("X-Access-Token", token);
        }

        let response = request.send().await.map_err(|e| {
            CodeletError::SandboxCommunication(format!("Execution request failed: {}", e))
        })?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(CodeletError::SandboxCommunication(format!(
                "Execution failed (HTTP {}): {}",
                status, body
            )));
        }

        let result = fold_execution_stream(&body)?;
        debug!(
            sandbox_id = %session.sandbox_id,
            stdout_len = result.stdout.len(),
            has_error = result.error.is_some(),
            "Snippet completed"
        );
        Ok(result)
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: BACKEND_NAME.to_string(),
            instance_id: self.current_session().map(|s| s.sandbox_id),
            state: self.state(),
            installed_packages: self
                .installed_packages
                .lock()
                .map(|p| p.clone())
                .unwrap_or_default(),
            metadata: HashMap::from([
                ("template".to_string(), self.config.template.clone()),
                ("api_url".to_string(), self.config.api_url.clone()),
            ]),
        }
    }

    async fn terminate(&self) -> Result<()> {
        let session = self.session.lock().ok().and_then(|mut lock| lock.take());
        self.set_state(ConnectionState::Terminated);

        if let Some(session) = session {
            self.kill_sandbox(&session.sandbox_id).await?;
        }
        Ok(())
    }
}

// E2B API types

#[derive(Serialize)]
struct CreateSandboxRequest {
    #[serde(rename = "templateID")]
    template_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    timeout: Option<u64>,
}

#[derive(Deserialize)]
struct CreatedSandbox {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(rename = "envdAccessToken", default)]
    envd_access_token: Option<String>,
    #[serde(default)]
    domain: Option<String>,
}

#[derive(Serialize)]
struct ExecuteRequest<'a> {
    code: &'a str,
}

#[derive(Deserialize)]
struct StreamText {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct ExecutionOutput {
    #[serde(default)]
    is_main_result: bool,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    png: Option<String>,
    #[serde(default)]
    jpeg: Option<String>,
    #[serde(default)]
    json: Option<serde_json::Value>,
}

impl ExecutionOutput {
    /// Pick the richest representation the kernel offered.
    fn into_raw_value(self) -> Option<RawValue> {
        if let Some(png) = self.png {
            return Some(RawValue::new(PayloadKind::Image, png));
        }
        if let Some(jpeg) = self.jpeg {
            return Some(RawValue::new(PayloadKind::Image, jpeg));
        }
        if let Some(json) = self.json {
            return Some(RawValue::new(PayloadKind::Json, json.to_string()));
        }
        self.text.map(|text| RawValue::new(PayloadKind::Repr, text))
    }
}

#[derive(Deserialize)]
struct ExecutionError {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    traceback: String,
}
