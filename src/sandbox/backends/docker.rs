use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::config::types::DockerConfig;
use crate::error::{CodeletError, Result};
use crate::sandbox::traits::{BackendKind, ConnectionState, SandboxBackend, SandboxInfo};
use crate::sandbox::RawExecResult;

/// Interpreter loop run inside the container.
const DRIVER_SOURCE: &str = include_str!("repl_driver.py");

/// Prefix the driver puts on every protocol line.
const RESPONSE_MARKER: &str = "@@codelet@@ ";

const BACKEND_NAME: &str = "docker";

/// The long-lived `docker exec -i` process hosting the interpreter.
struct DriverSession {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl DriverSession {
    /// Launch `command` running the driver and wait for its greeting.
    async fn spawn(mut command: Command) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                CodeletError::provision(
                    BACKEND_NAME,
                    format!("Failed to launch interpreter: {}", e),
                )
            })?;

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                return Err(CodeletError::provision(
                    BACKEND_NAME,
                    "Interpreter process has no stdio pipes",
                ))
            }
        };

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "Interpreter stderr");
                }
            });
        }

        let mut session = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let hello = session.read_message().await.map_err(|e| {
            CodeletError::provision(BACKEND_NAME, format!("Interpreter did not start: {}", e))
        })?;
        let hello: serde_json::Value = serde_json::from_str(&hello)?;
        if hello.get("ready").and_then(|v| v.as_bool()) != Some(true) {
            return Err(CodeletError::provision(
                BACKEND_NAME,
                format!("Unexpected interpreter greeting: {}", hello),
            ));
        }
        debug!(
            python = %hello.get("python").and_then(|v| v.as_str()).unwrap_or("?"),
            "Interpreter attached"
        );

        Ok(session)
    }

    /// Read the next protocol line, skipping anything the snippet wrote
    /// around the redirected stdout.
    async fn read_message(&mut self) -> Result<String> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self.stdout.read_line(&mut line).await?;
            if read == 0 {
                return Err(CodeletError::SandboxCommunication(
                    "interpreter process exited".to_string(),
                ));
            }
            if let Some(message) = protocol_message(&line) {
                return Ok(message.to_string());
            }
        }
    }
}

/// The payload of a protocol line. Output written straight to fd 1 without
/// a newline can end up in front of the marker; it is logged and dropped.
fn protocol_message(line: &str) -> Option<&str> {
    let Some(start) = line.find(RESPONSE_MARKER) else {
        if !line.trim().is_empty() {
            debug!(line = %line.trim_end(), "Skipping stray interpreter output");
        }
        return None;
    };
    if start > 0 {
        debug!(line = %line[..start].trim_end(), "Skipping stray interpreter output");
    }
    Some(line[start + RESPONSE_MARKER.len()..].trim_end())
}

/// Docker sandbox backend.
///
/// Starts one detached container per backend and keeps a single Python
/// process running inside it via `docker exec -i`. Snippets are exchanged
/// with that process as JSON lines, so interpreter state lives as long as
/// the backend does.
pub struct DockerBackend {
    config: DockerConfig,
    /// Container ID while the sandbox is up
    container_id: Mutex<Option<String>>,
    driver: tokio::sync::Mutex<Option<DriverSession>>,
    installed_packages: Mutex<Vec<String>>,
    state: Mutex<ConnectionState>,
}

impl DockerBackend {
    /// Start a container, install `packages` and launch the interpreter.
    ///
    /// If any step fails the container is removed before the error is
    /// returned.
    pub async fn provision(config: DockerConfig, packages: &[String]) -> Result<Self> {
        // Verify Docker is available
        if !Self::is_available() {
            return Err(CodeletError::provision(
                BACKEND_NAME,
                "Docker daemon is not accessible. Ensure Docker is installed and running.",
            ));
        }

        Self::ensure_image(&config.image, config.pull_image).await?;

        let backend = Self {
            config,
            container_id: Mutex::new(None),
            driver: tokio::sync::Mutex::new(None),
            installed_packages: Mutex::new(Vec::new()),
            state: Mutex::new(ConnectionState::Uninitialized),
        };

        let setup = async {
            backend.start_container().await?;
            backend.install_packages(packages).await?;
            backend.start_driver().await
        };

        if let Err(e) = setup.await {
            if let Err(cleanup) = backend.terminate().await {
                warn!(error = %cleanup, "Failed to clean up after provisioning error");
            }
            return Err(e);
        }

        info!(
            image = %backend.config.image,
            container_id = ?backend.get_container_id(),
            packages = ?packages,
            "Docker sandbox ready"
        );

        Ok(backend)
    }

    /// Check if the Docker backend is available on this system.
    ///
    /// Returns true if Docker daemon is accessible.
    pub fn is_available() -> bool {
        match std::process::Command::new("docker")
            .args(["info"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    /// Check if a Docker image exists locally.
    async fn image_exists(image: &str) -> bool {
        match Command::new("docker")
            .args(["image", "inspect", image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
        {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    async fn ensure_image(image: &str, pull: bool) -> Result<()> {
        if Self::image_exists(image).await {
            return Ok(());
        }
        if !pull {
            return Err(CodeletError::provision(
                BACKEND_NAME,
                format!(
                    "Docker image '{}' not found. Set docker.pull_image = true or pull it manually with: docker pull {}",
                    image, image
                ),
            ));
        }

        info!(image = %image, "Pulling Docker image...");
        let output = Command::new("docker")
            .args(["pull", image])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                CodeletError::provision(BACKEND_NAME, format!("Failed to run docker pull: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CodeletError::provision(
                BACKEND_NAME,
                format!("Failed to pull image '{}': {}", image, stderr.trim()),
            ));
        }
        Ok(())
    }

    /// Arguments for `docker run` that start the idle sandbox container.
    fn run_args(&self) -> Result<Vec<String>> {
        let mut args: Vec<String> = vec!["run".into(), "-d".into(), "--rm".into()];

        // Network isolation
        if !self.config.enable_networking {
            args.push("--network=none".into());
        }

        if let Some(limit) = self.config.memory_limit_mb {
            args.push(format!("--memory={}m", limit));
        }

        for mount in &self.config.mounts {
            if !mount.host_path.exists() {
                return Err(CodeletError::provision(
                    BACKEND_NAME,
                    format!("Mount path does not exist: {}", mount.host_path.display()),
                ));
            }
            let mode = if mount.readonly { "ro" } else { "rw" };
            args.push("-v".into());
            args.push(format!(
                "{}:{}:{}",
                mount.host_path.display(),
                mount.guest_path,
                mode
            ));
        }

        for (key, value) in &self.config.env_vars {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }

        args.push("-w".into());
        args.push(self.config.workdir.clone());

        // Keep the container alive; the interpreter is attached with docker exec
        args.push(self.config.image.clone());
        args.extend(["tail", "-f", "/dev/null"].map(String::from));

        Ok(args)
    }

    /// Arguments for the `docker exec` that hosts the interpreter.
    fn driver_args(&self, container_id: &str) -> Vec<String> {
        let mut args: Vec<String> = vec!["exec".into(), "-i".into()];
        args.push("-w".into());
        args.push(self.config.workdir.clone());

        if let Some(timeout) = self.config.snippet_timeout_seconds {
            args.push("-e".into());
            args.push(format!("CODELET_SNIPPET_TIMEOUT={}", timeout));
        }

        args.push(container_id.to_string());
        args.push(self.config.python.clone());
        args.push("-u".into());
        args.push("-c".into());
        args.push(DRIVER_SOURCE.to_string());
        args
    }

    async fn start_container(&self) -> Result<()> {
        info!(image = %self.config.image, "Starting Docker sandbox container...");

        let output = Command::new("docker")
            .args(self.run_args()?)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                CodeletError::provision(BACKEND_NAME, format!("Failed to start container: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CodeletError::provision(
                BACKEND_NAME,
                format!("Failed to start container: {}", stderr.trim()),
            ));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(container_id = %container_id, "Docker sandbox container started");

        let mut id_lock = self.container_id.lock().map_err(|e| {
            CodeletError::provision(BACKEND_NAME, format!("Failed to acquire lock: {}", e))
        })?;
        *id_lock = Some(container_id);
        drop(id_lock);

        self.set_state(ConnectionState::Running);
        Ok(())
    }

    async fn start_driver(&self) -> Result<()> {
        let container_id = self.require_container()?;

        let mut command = Command::new("docker");
        command.args(self.driver_args(&container_id));
        let session = DriverSession::spawn(command).await?;
        debug!(container_id = %container_id, "Interpreter running in container");

        *self.driver.lock().await = Some(session);
        Ok(())
    }

    /// Get the current container ID.
    fn get_container_id(&self) -> Option<String> {
        self.container_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn require_container(&self) -> Result<String> {
        self.get_container_id()
            .ok_or(CodeletError::UseAfterTermination)
    }

    fn set_state(&self, state: ConnectionState) {
        if let Ok(mut lock) = self.state.lock() {
            *lock = state;
        }
    }

    /// Force-remove the container. A container that is already gone counts
    /// as removed.
    async fn remove_container(&self, container_id: &str) -> Result<()> {
        info!(container_id = %container_id, "Removing Docker sandbox container...");

        let output = Command::new("docker")
            .args(["rm", "-f", container_id])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                CodeletError::SandboxCommunication(format!("Failed to remove container: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.contains("No such container") {
                warn!(container_id = %container_id, error = %stderr.trim(), "Failed to remove container");
            }
        }

        info!(container_id = %container_id, "Docker sandbox container removed");
        Ok(())
    }
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Container
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
        let container_id = self.require_container()?;
        info!(packages = ?packages, "Installing packages in container");

        let output = Command::new("docker")
            .args(["exec", container_id.as_str(), self.config.python.as_str()])
            .args([
                "-m",
                "pip",
                "install",
                "--quiet",
                "--disable-pip-version-check",
                "--root-user-action=ignore",
            ])
            .args(packages)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                CodeletError::provision(BACKEND_NAME, format!("Failed to run pip: {}", e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CodeletError::provision(
                BACKEND_NAME,
                format!("pip install {} failed: {}", packages.join(" "), stderr.trim()),
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

        let mut guard = self.driver.lock().await;
        let session = guard.as_mut().ok_or_else(|| {
            CodeletError::SandboxCommunication("interpreter is not attached".to_string())
        })?;

        let mut request = serde_json::to_string(&serde_json::json!({ "code": code }))?;
        request.push('\n');
        session.stdin.write_all(request.as_bytes()).await?;
        session.stdin.flush().await?;

        let response = session.read_message().await?;
        let result: RawExecResult = serde_json::from_str(&response).map_err(|e| {
            CodeletError::SandboxCommunication(format!("Malformed interpreter response: {}", e))
        })?;

        debug!(
            stdout_len = result.stdout.len(),
            has_result = result.result.is_some(),
            has_error = result.error.is_some(),
            "Snippet completed"
        );

        Ok(result)
    }

    fn info(&self) -> SandboxInfo {
        SandboxInfo {
            backend_type: BACKEND_NAME.to_string(),
            instance_id: self.get_container_id(),
            state: self.state(),
            installed_packages: self
                .installed_packages
                .lock()
                .map(|p| p.clone())
                .unwrap_or_default(),
            metadata: HashMap::from([
                ("image".to_string(), self.config.image.clone()),
                ("workdir".to_string(), self.config.workdir.clone()),
                (
                    "networking".to_string(),
                    self.config.enable_networking.to_string(),
                ),
            ]),
        }
    }

    async fn terminate(&self) -> Result<()> {
        if let Some(mut session) = self.driver.lock().await.take() {
            let _ = session.stdin.write_all(b"{\"shutdown\": true}\n").await;
            if let Err(e) = session.child.kill().await {
                debug!(error = %e, "Interpreter process already gone");
            }
        }

        let container_id = self
            .container_id
            .lock()
            .ok()
            .and_then(|mut lock| lock.take());

        self.set_state(ConnectionState::Terminated);

        if let Some(container_id) = container_id {
            self.remove_container(&container_id).await?;
        }
        Ok(())
    }
}
