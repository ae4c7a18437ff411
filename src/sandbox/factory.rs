use crate::config::types::{BackendType, CodeletConfig};
use crate::error::{CodeletError, Result};
use crate::sandbox::backends::{DockerBackend, E2bBackend};
use crate::sandbox::traits::SandboxBackend;

/// Provision a sandbox backend with `packages` installed.
///
/// `Auto` is resolved first; see [`resolve_backend_type`].
pub async fn provision_backend(
    config: &CodeletConfig,
    requested: BackendType,
    packages: &[String],
) -> Result<Box<dyn SandboxBackend>> {
    match resolve_backend_type(config, requested)? {
        BackendType::Docker => {
            let backend = DockerBackend::provision(config.docker.clone(), packages).await?;
            Ok(Box::new(backend))
        }
        BackendType::E2b => {
            let backend = E2bBackend::provision(config.e2b.clone(), packages).await?;
            Ok(Box::new(backend))
        }
        BackendType::Auto => {
            // Already resolved by resolve_backend_type
            unreachable!()
        }
    }
}

/// Resolve the backend type, handling Auto selection.
pub fn resolve_backend_type(config: &CodeletConfig, requested: BackendType) -> Result<BackendType> {
    resolve_with(
        requested,
        DockerBackend::is_available,
        E2bBackend::is_available(&config.e2b),
    )
}

fn resolve_with(
    requested: BackendType,
    docker_available: impl Fn() -> bool,
    e2b_available: bool,
) -> Result<BackendType> {
    match requested {
        BackendType::Auto => {
            // Priority: local Docker > E2B
            if docker_available() {
                return Ok(BackendType::Docker);
            }
            if e2b_available {
                return Ok(BackendType::E2b);
            }
            Err(CodeletError::provision(
                "auto",
                "No sandbox backend available: Docker is not running and no E2B API key is configured",
            ))
        }
        other => Ok(other),
    }
}

/// Get information about available backends on this system.
pub fn available_backends(config: &CodeletConfig) -> Vec<BackendInfo> {
    let docker = DockerBackend::is_available();
    let e2b = E2bBackend::is_available(&config.e2b);

    vec![
        BackendInfo {
            name: "docker",
            available: docker,
            description: "Local Docker container",
            unavailable_reason: if docker {
                None
            } else {
                Some("Docker daemon not accessible")
            },
        },
        BackendInfo {
            name: "e2b",
            available: e2b,
            description: "E2B cloud sandbox",
            unavailable_reason: if e2b {
                None
            } else {
                Some("No API key (set e2b.api_key or E2B_API_KEY)")
            },
        },
    ]
}

/// Information about a sandbox backend.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BackendInfo {
    pub name: &'static str,
    pub available: bool,
    pub description: &'static str,
    pub unavailable_reason: Option<&'static str>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_prefers_docker() {
        assert_eq!(
            resolve_with(BackendType::Auto, || true, true).unwrap(),
            BackendType::Docker
        );
        assert_eq!(
            resolve_with(BackendType::Auto, || false, true).unwrap(),
            BackendType::E2b
        );
    }

    #[test]
    fn test_auto_without_backends_fails_provisioning() {
        assert!(matches!(
            resolve_with(BackendType::Auto, || false, false),
            Err(CodeletError::Provision { .. })
        ));
    }

    #[test]
    fn test_explicit_choice_is_kept() {
        assert_eq!(
            resolve_with(BackendType::E2b, || true, false).unwrap(),
            BackendType::E2b
        );
        assert_eq!(
            resolve_with(BackendType::Docker, || false, false).unwrap(),
            BackendType::Docker
        );
    }
}
