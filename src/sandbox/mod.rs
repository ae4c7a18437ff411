mod backends;
mod factory;
mod packages;
mod traits;

pub use backends::{DockerBackend, E2bBackend};
pub use factory::{available_backends, provision_backend, resolve_backend_type, BackendInfo};
pub use packages::{normalize_package, resolve_packages, IMAGE_DECODING_PACKAGES};
pub use traits::{BackendKind, ConnectionState, SandboxBackend, SandboxInfo};

use serde::{Deserialize, Serialize};

/// How the sandbox serialized a snippet's return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// A Python `str`, carried verbatim
    Text,
    /// `json.dumps` output
    Json,
    /// Python `repr()` text
    Repr,
    /// Base64 encoded image file bytes
    Image,
}

/// A return value as it crossed the sandbox boundary, before decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawValue {
    pub kind: PayloadKind,
    pub data: String,
}

impl RawValue {
    pub fn new(kind: PayloadKind, data: impl Into<String>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The snippet never ran because it failed to parse
    Syntax,
    /// The snippet raised while running
    Runtime,
}

/// An exception reported by the sandbox interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    /// Exception class name, e.g. `NameError`
    pub name: String,
    pub message: String,
    /// Formatted traceback as printed by the interpreter
    #[serde(default)]
    pub traceback: String,
}

impl ErrorInfo {
    /// Classify an exception by its class name.
    pub fn from_exception(
        name: impl Into<String>,
        message: impl Into<String>,
        traceback: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let kind = if matches!(
            name.as_str(),
            "SyntaxError" | "IndentationError" | "TabError"
        ) {
            ErrorKind::Syntax
        } else {
            ErrorKind::Runtime
        };
        Self {
            kind,
            name,
            message: message.into(),
            traceback: traceback.into(),
        }
    }
}

/// Everything one snippet produced inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawExecResult {
    /// Stdout emitted during this snippet only
    #[serde(default)]
    pub stdout: String,
    /// Value of the trailing expression, if any
    #[serde(default)]
    pub result: Option<RawValue>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}
