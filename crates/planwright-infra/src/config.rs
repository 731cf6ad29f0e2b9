//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.planwright/` unless
//! `PLANWRIGHT_DATA_DIR` says otherwise) into [`EngineConfig`]. Falls back to
//! defaults when the file is missing or malformed.

use std::path::{Path, PathBuf};

use planwright_types::config::EngineConfig;

/// Environment variable that overrides the data directory.
pub const DATA_DIR_ENV: &str = "PLANWRIGHT_DATA_DIR";

/// Resolve the data directory: `PLANWRIGHT_DATA_DIR`, else `~/.planwright`,
/// else `./.planwright` when no home directory is known.
pub fn resolve_data_dir() -> PathBuf {
    data_dir_from(std::env::var_os(DATA_DIR_ENV).map(PathBuf::from), dirs::home_dir())
}

fn data_dir_from(overridden: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    match overridden {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => home.unwrap_or_else(|| PathBuf::from(".")).join(".planwright"),
    }
}

/// Load `{data_dir}/config.toml`.
///
/// - Missing file: [`EngineConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_engine_config_missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[tokio::test]
    async fn load_engine_config_valid_toml_returns_parsed() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(
            tmp.path().join("config.toml"),
            r#"
[engine]
max_concurrent_jobs = 16
sweep_interval_secs = 0

[tasks]
default_timeout_secs = 60
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.engine.max_concurrent_jobs, 16);
        assert_eq!(config.engine.sweep_interval_secs, 0);
        assert_eq!(config.tasks.default_timeout_secs, 60);
        assert_eq!(config.server.port, 7420);
    }

    #[tokio::test]
    async fn load_engine_config_invalid_toml_returns_default() {
        let tmp = TempDir::new().unwrap();
        tokio::fs::write(tmp.path().join("config.toml"), "this is not { valid toml !!!")
            .await
            .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn data_dir_prefers_override() {
        let dir = data_dir_from(Some(PathBuf::from("/srv/pw")), Some(PathBuf::from("/home/ana")));
        assert_eq!(dir, PathBuf::from("/srv/pw"));
    }

    #[test]
    fn data_dir_falls_back_to_home() {
        let dir = data_dir_from(None, Some(PathBuf::from("/home/ana")));
        assert_eq!(dir, PathBuf::from("/home/ana/.planwright"));

        let dir = data_dir_from(Some(PathBuf::new()), None);
        assert_eq!(dir, PathBuf::from("./.planwright"));
    }
}
