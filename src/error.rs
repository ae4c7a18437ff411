use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodeletError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: String },

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    // Sandbox lifecycle errors
    #[error("Failed to provision {backend} sandbox: {reason}")]
    Provision { backend: String, reason: String },

    #[error("Lost connection to sandbox: {0}")]
    SandboxCommunication(String),

    #[error("Executor has been terminated and can no longer be used")]
    UseAfterTermination,

    // Snippet errors
    #[error("SyntaxError in submitted code: {message}\nCode:\n{code}")]
    CodeSyntax { message: String, code: String },

    #[error("Code execution failed:\n{traceback}")]
    RemoteExecution { traceback: String, logs: String },

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl CodeletError {
    /// Whether the executor that produced this error can keep accepting snippets.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::CodeSyntax { .. } | Self::RemoteExecution { .. })
    }

    pub(crate) fn provision(backend: &str, reason: impl Into<String>) -> Self {
        Self::Provision {
            backend: backend.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodeletError>;
