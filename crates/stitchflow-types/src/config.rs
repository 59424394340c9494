//! Global configuration types for Stitchflow.
//!
//! `GlobalConfig` represents the top-level `config.toml` controlling the
//! callback verification window, provider endpoints, and engine defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Stitchflow engine.
///
/// Loaded from `{data_dir}/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Maximum accepted age of a completion callback, in seconds.
    /// Bounds the replay window in both directions.
    #[serde(default = "default_callback_freshness_secs")]
    pub callback_freshness_secs: u64,

    /// Shared secret for callback HMAC verification. Usually overridden via
    /// the `STITCHFLOW_CALLBACK_SECRET` environment variable.
    #[serde(default)]
    pub callback_secret: Option<String>,

    /// Base URL of the provider gateway.
    #[serde(default = "default_provider_base_url")]
    pub provider_base_url: String,

    /// Public base URL workers use to reach the callback endpoint.
    #[serde(default = "default_callback_base_url")]
    pub callback_base_url: String,

    /// Default node timeout in seconds.
    #[serde(default = "default_node_timeout_secs")]
    pub default_node_timeout_secs: u64,

    /// Default run timeout in seconds.
    #[serde(default = "default_run_timeout_secs")]
    pub default_run_timeout_secs: u64,
}

fn default_callback_freshness_secs() -> u64 {
    300
}

fn default_provider_base_url() -> String {
    "http://localhost:9800".to_string()
}

fn default_callback_base_url() -> String {
    "http://localhost:8700".to_string()
}

fn default_node_timeout_secs() -> u64 {
    300
}

fn default_run_timeout_secs() -> u64 {
    1800
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            callback_freshness_secs: default_callback_freshness_secs(),
            callback_secret: None,
            provider_base_url: default_provider_base_url(),
            callback_base_url: default_callback_base_url(),
            default_node_timeout_secs: default_node_timeout_secs(),
            default_run_timeout_secs: default_run_timeout_secs(),
        }
    }
}
