use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::sandbox::RawExecResult;

/// Which family of isolation a backend provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Container,
    CloudSandbox,
}

/// Lifecycle of the resource behind a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Running,
    Terminated,
}

/// Information about the running sandbox instance
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    /// Backend type identifier
    pub backend_type: String,
    /// Instance identifier (container ID, sandbox ID)
    pub instance_id: Option<String>,
    pub state: ConnectionState,
    /// Packages installed during provisioning, in install order
    pub installed_packages: Vec<String>,
    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Trait for sandbox execution backends.
///
/// A backend owns one isolated, long-lived Python interpreter. Every snippet
/// passed to [`run_snippet`](SandboxBackend::run_snippet) runs against the
/// same globals, so definitions made by one snippet are visible to the next.
/// Instances never share interpreter state with each other.
///
/// Provisioning happens in each backend's constructor; a value of this trait
/// is always past `Uninitialized`.
#[async_trait]
pub trait SandboxBackend: Send + Sync {
    /// Returns the backend name (e.g., "docker", "e2b")
    fn name(&self) -> &str;

    fn kind(&self) -> BackendKind;

    fn state(&self) -> ConnectionState;

    /// Install packages by distribution name into the sandbox interpreter.
    async fn install_packages(&self, packages: &[String]) -> Result<()>;

    /// Run a snippet in the persistent interpreter.
    ///
    /// Interpreter-level failures come back inside the result; `Err` is only
    /// returned when the sandbox itself could not be reached.
    async fn run_snippet(&self, code: &str) -> Result<RawExecResult>;

    /// Get information about the sandbox instance
    fn info(&self) -> SandboxInfo;

    /// Stop and remove the sandbox. Calls after the first are no-ops.
    async fn terminate(&self) -> Result<()>;
}
