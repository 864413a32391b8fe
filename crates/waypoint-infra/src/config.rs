//! Engine configuration loading for Waypoint.
//!
//! Reads `config.toml` from the data directory (`~/.waypoint/` in production)
//! and deserializes it into [`EngineConfig`]. Falls back to defaults when the
//! file is missing or malformed.

use std::path::{Path, PathBuf};

use waypoint_types::config::EngineConfig;

const DATA_DIR_ENV: &str = "WAYPOINT_DATA_DIR";

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - Otherwise returns the parsed config.
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
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineConfig::default()
        }
    }
}

/// Resolve the data directory from environment or platform defaults.
///
/// Priority:
/// 1. `WAYPOINT_DATA_DIR` environment variable
/// 2. `~/.waypoint`
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".waypoint");
    }

    // Last resort: current directory
    PathBuf::from(".waypoint")
}

/// The database URL to open: the configured override, else `{data_dir}/waypoint.db`.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| crate::sqlite::pool::database_url(data_dir))
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
max_field_length = 40
tick_interval_secs = 15
history_days = 7
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(tmp.path()).await;
        assert_eq!(config.max_field_length, 40);
        assert_eq!(config.tick_interval_secs, 15);
        assert_eq!(config.history_days, 7);
        assert!(config.detached_actions);
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
    fn resolve_database_url_prefers_override() {
        let data_dir = Path::new("/srv/waypoint");
        let mut config = EngineConfig::default();
        assert_eq!(
            resolve_database_url(&config, data_dir),
            "sqlite:///srv/waypoint/waypoint.db?mode=rwc"
        );

        config.database_url = Some("sqlite::memory:".into());
        assert_eq!(resolve_database_url(&config, data_dir), "sqlite::memory:");
    }

    #[test]
    fn test_resolve_data_dir_from_env() {
        // SAFETY: This test is single-threaded and restores the env var immediately.
        unsafe {
            std::env::set_var(DATA_DIR_ENV, "/tmp/test-waypoint");
        }
        let dir = resolve_data_dir();
        assert_eq!(dir, PathBuf::from("/tmp/test-waypoint"));
        unsafe {
            std::env::remove_var(DATA_DIR_ENV);
        }
    }
}
