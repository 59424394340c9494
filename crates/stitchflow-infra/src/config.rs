//! Global configuration loader for Stitchflow.
//!
//! Reads `config.toml` from the data directory (`~/.stitchflow/` in
//! production) and deserializes it into `GlobalConfig`. Falls back to
//! defaults when the file is missing or malformed. Environment variables
//! override file values for secrets.

use std::path::{Path, PathBuf};

use stitchflow_types::config::GlobalConfig;

/// Resolve the data directory: `STITCHFLOW_DATA_DIR`, else `~/.stitchflow`.
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("STITCHFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stitchflow")
}

/// Load global configuration from `{data_dir}/config.toml`.
///
/// - Missing file: returns `GlobalConfig::default()`.
/// - Unparseable file: logs a warning and returns the default.
pub async fn load_global_config(data_dir: &Path) -> GlobalConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return GlobalConfig::default();
        }
    };

    match toml::from_str::<GlobalConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            GlobalConfig::default()
        }
    }
}

/// Resolve the callback signing secret.
///
/// Priority: `STITCHFLOW_CALLBACK_SECRET` env var, then `config.toml`.
pub fn resolve_callback_secret(config: &GlobalConfig) -> Option<String> {
    std::env::var("STITCHFLOW_CALLBACK_SECRET")
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| config.callback_secret.clone())
}
