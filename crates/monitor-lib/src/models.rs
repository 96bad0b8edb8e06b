//! Core data models for the platform monitor

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// A running container whose name matched the platform naming convention
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub id: String,
    pub name: String,
    pub app_id: String,
    pub tenant_id: String,
    pub service: String,
}

/// Health classification of a container's service endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Per-container health tracking state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthState {
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check: DateTime<Utc>,
}

/// Published when a container's health status transitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthChange {
    pub container_name: String,
    pub tenant_id: String,
    pub service: String,
    pub previous: HealthStatus,
    pub current: HealthStatus,
    pub consecutive_failures: u32,
    pub last_check: DateTime<Utc>,
}

/// One point-in-time resource sample for a managed container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub container_id: String,
    pub name: String,
    pub app_id: String,
    pub tenant_id: String,
    pub service: String,
    pub cpu_percent: f64,
    pub mem_usage_bytes: u64,
    pub mem_limit_bytes: u64,
    pub mem_percent: f64,
    pub net_rx_bytes: u64,
    pub net_tx_bytes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Rollup of the latest samples grouped by (app, tenant)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantAggregate {
    pub app_id: String,
    pub tenant_id: String,
    pub cpu_percent: f64,
    pub mem_usage_bytes: u64,
    pub mem_limit_bytes: u64,
    pub containers: usize,
}

/// Batch result of one collection cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub containers: Vec<MetricsSample>,
    pub tenants: Vec<TenantAggregate>,
}

/// Lifecycle action reported by the container runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleAction {
    Start,
    Stop,
    Die,
}

/// A container start/stop/die event from the runtime stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLifecycle {
    pub action: LifecycleAction,
    pub container_name: String,
    pub container_id: String,
    pub time: DateTime<Utc>,
}

/// Severity attached to alert rules and history entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// Condition evaluated by the alert engine, tagged by rule type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertCondition {
    ContainerDown {
        #[serde(default, with = "duration_str")]
        duration: Duration,
    },
    CpuThreshold {
        threshold: f64,
        #[serde(default, with = "duration_str")]
        duration: Duration,
    },
    MemoryThreshold {
        threshold: f64,
        #[serde(default, with = "duration_str")]
        duration: Duration,
    },
    HealthCheckFailed {
        #[serde(default = "default_consecutive_failures")]
        consecutive_failures: u32,
    },
}

/// An alerting rule supplied by platform configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub condition: AlertCondition,
    #[serde(default = "default_cooldown", with = "duration_str")]
    pub cooldown: Duration,
    #[serde(default = "default_severity")]
    pub severity: AlertSeverity,
}

/// One durable line of alert history; fire and resolve are separate entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertHistoryEntry {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    pub fired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outbound delivery target kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Webhook,
}

/// Webhook destination settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// A configured notification channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ChannelKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub config: WebhookConfig,
}

/// Probe protocol for service health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckProtocol {
    Http,
    Tcp,
}

/// Health-check declaration for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub protocol: CheckProtocol,
    #[serde(default = "default_check_path")]
    pub path: String,
    /// Probe port; falls back to the service's internal port
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_check_interval", with = "duration_str")]
    pub interval: Duration,
    /// Probe host override; falls back to the container name
    #[serde(default)]
    pub host: Option<String>,
}

/// Per-service declaration from the platform document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub internal_port: u16,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

/// The platform configuration document consumed by the pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub naming_prefix: String,
    #[serde(default)]
    pub services: HashMap<String, ServiceSpec>,
    #[serde(default)]
    pub alert_rules: Vec<AlertRule>,
}

impl PlatformConfig {
    /// Parses a platform document leniently: a service entry or alert rule
    /// that fails to deserialize is logged and skipped so one bad record
    /// cannot take the whole pipeline down with it.
    pub fn from_json(doc: &serde_json::Value) -> anyhow::Result<Self> {
        use anyhow::Context;

        let naming_prefix = doc
            .get("naming_prefix")
            .and_then(|v| v.as_str())
            .context("platform document is missing `naming_prefix`")?
            .to_string();

        let mut services = HashMap::new();
        if let Some(map) = doc.get("services").and_then(|v| v.as_object()) {
            for (name, raw) in map {
                match serde_json::from_value::<ServiceSpec>(raw.clone()) {
                    Ok(spec) => {
                        services.insert(name.clone(), spec);
                    }
                    Err(err) => {
                        warn!(service = %name, error = %err, "Skipping malformed service entry");
                    }
                }
            }
        }

        let mut alert_rules = Vec::new();
        if let Some(raw_rules) = doc.get("alert_rules").and_then(|v| v.as_array()) {
            for raw in raw_rules {
                match serde_json::from_value::<AlertRule>(raw.clone()) {
                    Ok(rule) => alert_rules.push(rule),
                    Err(err) => {
                        warn!(error = %err, "Skipping malformed alert rule");
                    }
                }
            }
        }

        Ok(Self {
            naming_prefix,
            services,
            alert_rules,
        })
    }

    /// Names of all declared services, for container-name matching
    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }
}

fn default_consecutive_failures() -> u32 {
    3
}

fn default_cooldown() -> Duration {
    Duration::from_secs(300)
}

fn default_severity() -> AlertSeverity {
    AlertSeverity::Warning
}

fn default_enabled() -> bool {
    true
}

fn default_check_path() -> String {
    "/".to_string()
}

fn default_check_interval() -> Duration {
    Duration::from_secs(30)
}

/// Duration parse failure
#[derive(Debug, thiserror::Error)]
pub enum DurationParseError {
    #[error("empty duration")]
    Empty,
    #[error("invalid duration `{0}`")]
    Invalid(String),
    #[error("unknown duration unit `{0}`")]
    UnknownUnit(char),
}

/// Parses `"45s"`, `"5m"`, `"1h30m"` style duration strings; bare digits
/// are taken as seconds.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationParseError::Empty);
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        let secs = s
            .parse::<u64>()
            .map_err(|_| DurationParseError::Invalid(input.to_string()))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            let value = digits
                .parse::<u64>()
                .map_err(|_| DurationParseError::Invalid(input.to_string()))?;
            let unit: u64 = match c {
                's' => 1,
                'm' => 60,
                'h' => 3600,
                'd' => 86400,
                _ => return Err(DurationParseError::UnknownUnit(c)),
            };
            total = total.saturating_add(value.saturating_mul(unit));
            digits.clear();
        }
    }
    if !digits.is_empty() {
        // a trailing number without a unit ("1h30") is ambiguous
        return Err(DurationParseError::Invalid(input.to_string()));
    }
    Ok(Duration::from_secs(total))
}

fn format_duration(d: &Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs >= 60 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Serde adapter for human-readable duration strings
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        super::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
