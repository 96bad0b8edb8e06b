//! Monitor configuration

use anyhow::{Context, Result};
use monitor_lib::models::PlatformConfig;
use serde::Deserialize;

/// Agent process configuration, read from `MONITOR_*` environment
/// variables
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// API server port for queries, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Docker Engine API endpoint
    #[serde(default = "default_docker_endpoint")]
    pub docker_endpoint: String,

    /// Path to the platform document (naming prefix, services, rules)
    #[serde(default = "default_platform_config_path")]
    pub platform_config_path: String,

    /// Alert history JSONL file; in-memory only when unset
    #[serde(default)]
    pub alert_history_path: Option<String>,

    /// Notification channel JSON document; in-memory only when unset
    #[serde(default)]
    pub channels_path: Option<String>,

    /// HS256 secret for verifying realtime subscriber tokens
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// Metrics collection interval in seconds
    #[serde(default = "default_collection_interval")]
    pub collection_interval_secs: u64,

    /// Event bus channel capacity
    #[serde(default = "default_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_api_port() -> u16 {
    8080
}

fn default_docker_endpoint() -> String {
    "http://127.0.0.1:2375".to_string()
}

fn default_platform_config_path() -> String {
    "/etc/platform-monitor/platform.json".to_string()
}

fn default_collection_interval() -> u64 {
    15
}

fn default_bus_capacity() -> usize {
    256
}

impl MonitorConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("MONITOR"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| MonitorConfig {
            api_port: default_api_port(),
            docker_endpoint: default_docker_endpoint(),
            platform_config_path: default_platform_config_path(),
            alert_history_path: None,
            channels_path: None,
            jwt_secret: None,
            collection_interval_secs: default_collection_interval(),
            event_bus_capacity: default_bus_capacity(),
        }))
    }

    /// Read and parse the platform document the monitor works against
    pub fn load_platform(&self) -> Result<PlatformConfig> {
        let raw = std::fs::read_to_string(&self.platform_config_path)
            .with_context(|| format!("reading platform config {}", self.platform_config_path))?;
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing platform config {}", self.platform_config_path))?;
        PlatformConfig::from_json(&value)
    }
}
