//! Engine configuration loader for Conductor.
//!
//! Reads `conductor.toml` and deserializes it into [`EngineConfig`]. Falls
//! back to defaults when the file is missing or malformed. The result is
//! always passed through [`EngineConfig::validated`].

use std::path::{Path, PathBuf};

use conductor_types::config::EngineConfig;

/// File name looked up in the data directory when no path is given.
pub const CONFIG_FILE_NAME: &str = "conductor.toml";

/// `{data_dir}/conductor.toml`.
pub fn default_config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Load engine configuration from `path`.
///
/// - If the file does not exist, returns [`EngineConfig::default()`].
/// - If the file exists but cannot be read or parsed, logs a warning and
///   returns the default.
/// - Otherwise returns the parsed config; unset keys take their defaults.
pub async fn load_engine_config(path: &Path) -> EngineConfig {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config found at {}, using defaults", path.display());
            return EngineConfig::default().validated();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
            return EngineConfig::default().validated();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => {
            tracing::debug!(path = %path.display(), "loaded engine config");
            config.validated()
        }
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
            EngineConfig::default().validated()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let config = load_engine_config(&default_config_path(tmp.path())).await;
        assert_eq!(config, EngineConfig::default().validated());
        assert_eq!(config.max_concurrent_workflows, 32);
    }

    #[tokio::test]
    async fn partial_file_keeps_defaults_for_unset_keys() {
        let tmp = TempDir::new().unwrap();
        let path = default_config_path(tmp.path());
        tokio::fs::write(
            &path,
            r#"
engine_id = "engine-eu-1"
max_concurrent_workflows = 4

[lock]
ttl_ms = 9000
require_acquisition = true
"#,
        )
        .await
        .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.engine_id.as_deref(), Some("engine-eu-1"));
        assert_eq!(config.max_concurrent_workflows, 4);
        assert_eq!(config.max_concurrent_nodes, 64);
        assert_eq!(config.lock.ttl_ms, 9000);
        assert!(config.lock.require_acquisition);
        // The default renewal interval is still below the shorter TTL.
        assert!(config.lock.renewal_interval_ms < config.lock.ttl_ms);
    }

    #[tokio::test]
    async fn renewal_interval_is_clamped_below_ttl() {
        let tmp = TempDir::new().unwrap();
        let path = default_config_path(tmp.path());
        tokio::fs::write(&path, "[lock]\nttl_ms = 3000\nrenewal_interval_ms = 5000\n")
            .await
            .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config.lock.renewal_interval_ms, 1000);
    }

    #[tokio::test]
    async fn malformed_file_returns_default() {
        let tmp = TempDir::new().unwrap();
        let path = default_config_path(tmp.path());
        tokio::fs::write(&path, "max_concurrent_workflows = \"lots\"\n[[[")
            .await
            .unwrap();

        let config = load_engine_config(&path).await;
        assert_eq!(config, EngineConfig::default().validated());
    }
}
