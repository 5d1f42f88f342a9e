//! Configuration loader for acidic jobs.
//!
//! Reads `acidic.toml` from the data directory (`~/.acidic/` in production)
//! and deserializes it into [`AcidicConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::Path;

use acidic_types::config::AcidicConfig;

/// Load configuration from `{data_dir}/acidic.toml`.
///
/// - If the file does not exist, returns [`AcidicConfig::default()`].
/// - If the file exists but fails to parse, logs a warning and returns the default.
/// - If the file exists and parses successfully, returns the parsed config.
pub async fn load_config(data_dir: &Path) -> AcidicConfig {
    let config_path = data_dir.join("acidic.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No acidic.toml found at {}, using defaults", config_path.display());
            return AcidicConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return AcidicConfig::default();
        }
    };

    match toml::from_str::<AcidicConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            AcidicConfig::default()
        }
    }
}
