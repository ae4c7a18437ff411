use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::logger::LogLevel;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CodeletConfig {
    pub executor: ExecutorConfig,
    pub docker: DockerConfig,
    pub e2b: E2bConfig,
}

/// The type of sandbox backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Local Docker container
    Docker,
    /// E2B cloud sandbox
    E2b,
    /// Docker when the daemon answers, otherwise E2B if an API key is set
    #[default]
    Auto,
}

impl BackendType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Docker => "docker",
            Self::E2b => "e2b",
            Self::Auto => "auto",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Which backend to use
    pub backend: BackendType,
    /// Packages installed in every sandbox on top of the backend's base packages
    pub additional_imports: Vec<String>,
    /// Verbosity of the executor logger
    pub log_level: LogLevel,
}

/// A host directory exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub host_path: PathBuf,
    pub guest_path: String,
    #[serde(default)]
    pub readonly: bool,
}

impl std::str::FromStr for Mount {
    type Err = String;

    /// Parses `host_path:guest_path[:ro]`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [host, guest] => Ok(Mount {
                host_path: PathBuf::from(host),
                guest_path: guest.to_string(),
                readonly: false,
            }),
            [host, guest, "ro"] => Ok(Mount {
                host_path: PathBuf::from(host),
                guest_path: guest.to_string(),
                readonly: true,
            }),
            _ => Err("Mount format: host_path:guest_path[:ro]".to_string()),
        }
    }
}

/// Docker-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Image providing the Python interpreter
    pub image: String,
    /// Pull the image when it is not present locally
    pub pull_image: bool,
    /// Interpreter executable inside the image
    pub python: String,
    /// Enable networking in the container. Installing packages needs it.
    pub enable_networking: bool,
    /// Container memory limit in MB (unlimited when unset)
    pub memory_limit_mb: Option<u64>,
    /// Working directory inside the container
    pub workdir: String,
    /// Host directories to mount
    pub mounts: Vec<Mount>,
    /// Environment variables [(KEY, VALUE), ...]
    pub env_vars: Vec<(String, String)>,
    /// Packages installed before any requested import
    pub base_packages: Vec<String>,
    /// Per-snippet wall clock limit enforced by the in-container driver
    pub snippet_timeout_seconds: Option<u64>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "python:3.12-slim".to_string(),
            pull_image: true,
            python: "python".to_string(),
            enable_networking: true,
            memory_limit_mb: None,
            workdir: "/workspace".to_string(),
            mounts: Vec::new(),
            env_vars: Vec::new(),
            base_packages: Vec::new(),
            snippet_timeout_seconds: None,
        }
    }
}

/// E2B cloud sandbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct E2bConfig {
    /// API key (falls back to the E2B_API_KEY environment variable)
    pub api_key: Option<String>,
    /// Control plane endpoint
    pub api_url: String,
    /// Domain sandboxes are served under
    pub domain: String,
    /// Sandbox template to start
    pub template: String,
    /// Packages installed before any requested import
    pub base_packages: Vec<String>,
    /// Sandbox lifetime forwarded to E2B on creation
    pub sandbox_timeout_seconds: Option<u64>,
    /// HTTP timeout applied to every request, including code execution
    pub request_timeout_seconds: Option<u64>,
}

impl Default for E2bConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: "https://api.e2b.dev".to_string(),
            domain: "e2b.app".to_string(),
            template: "code-interpreter-v1".to_string(),
            base_packages: Vec::new(),
            sandbox_timeout_seconds: None,
            request_timeout_seconds: None,
        }
    }
}

impl E2bConfig {
    pub const API_KEY_ENV: &'static str = "E2B_API_KEY";

    /// The configured API key, or the one found in the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(Self::API_KEY_ENV).ok())
            .filter(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mount() {
        let mount: Mount = "/tmp/data:/data".parse().unwrap();
        assert_eq!(mount.host_path, PathBuf::from("/tmp/data"));
        assert_eq!(mount.guest_path, "/data");
        assert!(!mount.readonly);

        let mount: Mount = "/tmp/data:/data:ro".parse().unwrap();
        assert!(mount.readonly);

        assert!("/tmp/data".parse::<Mount>().is_err());
        assert!("/a:/b:rw".parse::<Mount>().is_err());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: CodeletConfig = toml::from_str(
            r#"
            [executor]
            backend = "docker"
            additional_imports = ["numpy"]

            [docker]
            image = "python:3.11"
            "#,
        )
        .unwrap();

        assert_eq!(config.executor.backend, BackendType::Docker);
        assert_eq!(config.executor.additional_imports, vec!["numpy"]);
        assert_eq!(config.executor.log_level, LogLevel::Info);
        assert_eq!(config.docker.image, "python:3.11");
        assert_eq!(config.docker.workdir, "/workspace");
        assert!(config.docker.snippet_timeout_seconds.is_none());
        assert_eq!(config.e2b.template, "code-interpreter-v1");
    }

    #[test]
    fn test_explicit_api_key_wins() {
        let config = E2bConfig {
            api_key: Some("e2b_explicit".to_string()),
            ..Default::default()
        };
        assert_eq!(config.resolve_api_key().as_deref(), Some("e2b_explicit"));
    }
}
