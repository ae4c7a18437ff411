use std::path::{Path, PathBuf};

use crate::config::types::CodeletConfig;
use crate::error::{CodeletError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "codelet", "codelet") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".codelet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// A missing default file yields defaults; a missing file that was asked
/// for explicitly is an error.
pub fn load_config(config_path: Option<&Path>) -> Result<CodeletConfig> {
    let path = match config_path {
        Some(path) => {
            if !path.exists() {
                return Err(CodeletError::ConfigNotFound {
                    path: path.display().to_string(),
                });
            }
            path.to_path_buf()
        }
        None => get_config_path(),
    };

    if !path.exists() {
        return Ok(CodeletConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<CodeletConfig> {
    toml::from_str(content).map_err(|e| CodeletError::TomlParse(e.to_string()))
}

/// Write a default configuration file, refusing to clobber one unless `force`.
pub fn write_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(CodeletError::Config(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(&CodeletConfig::default())
        .map_err(|e| CodeletError::Config(e.to_string()))?;
    std::fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::BackendType;

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(matches!(
            load_config(Some(&missing)),
            Err(CodeletError::ConfigNotFound { .. })
        ));
    }

    #[test]
    fn test_default_config_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        write_default_config(&path, false).unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.executor.backend, BackendType::Auto);
        assert_eq!(config.docker.image, "python:3.12-slim");

        assert!(write_default_config(&path, false).is_err());
        write_default_config(&path, true).unwrap();
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let err = parse_config("[executor\nbackend = 1").unwrap_err();
        assert!(matches!(err, CodeletError::TomlParse(_)));
    }
}
