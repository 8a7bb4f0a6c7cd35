use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::types::SandkitConfig;
use crate::error::{Result, SandkitError};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "sandkit", "sandkit") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".sandkit").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(config_path: Option<&Path>) -> Result<SandkitConfig> {
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        // Return defaults if no config file exists
        debug!(path = %path.display(), "No configuration file, using defaults");
        return Ok(SandkitConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: SandkitConfig =
        toml::from_str(&content).map_err(|e| SandkitError::TomlParse(e.to_string()))?;

    Ok(config.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(config.engine.default_memory_limit_mb, 128);
        assert_eq!(config.engine.default_timeout_ms, 5000);
    }

    #[test]
    fn test_loaded_values_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[engine]\ndefault_memory_limit_mb = 2\ndefault_timeout_ms = 90000\n",
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.engine.default_memory_limit_mb, 8);
        assert_eq!(config.engine.default_timeout_ms, 30_000);
    }

    #[test]
    fn test_invalid_toml_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[engine\n").unwrap();

        let err = load_config(Some(&path)).unwrap_err();
        assert!(matches!(err, SandkitError::TomlParse(_)));
    }
}
