//! Docker Engine API runtime adapter
//!
//! Talks to the engine over its HTTP endpoint. Stats are sampled one-shot
//! (`stream=false`), which makes the engine return the current and the
//! pre-read (`precpu_stats`) CPU counters in a single response. Lifecycle
//! events come from the NDJSON `/events` stream, re-opened with a short
//! delay whenever it drops.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    async_trait, ContainerRuntime, CpuCounters, MemoryCounters, NetworkCounters, RuntimeContainer,
    StatsSample,
};
use crate::health::{components, AgentHealth};
use crate::models::{ContainerLifecycle, LifecycleAction};

const EVENT_BUFFER: usize = 256;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Docker Engine connection settings
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Engine HTTP endpoint, e.g. `http://127.0.0.1:2375`
    pub endpoint: String,
    /// Per-request timeout for list/stats calls
    pub request_timeout: Duration,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:2375".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// `ContainerRuntime` backed by the Docker Engine API
pub struct DockerRuntime {
    config: DockerConfig,
    client: reqwest::Client,
    /// Separate client without a total-request timeout; the event stream
    /// is expected to stay open indefinitely
    stream_client: reqwest::Client,
    health: Option<AgentHealth>,
}

impl DockerRuntime {
    pub fn new(config: DockerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context("building docker api client")?;
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .context("building docker event stream client")?;

        Ok(Self {
            config,
            client,
            stream_client,
            health: None,
        })
    }

    /// Report event-stream connectivity into the agent health registry
    pub fn set_health_registry(&mut self, health: AgentHealth) {
        self.health = Some(health);
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<RuntimeContainer>> {
        let url = format!("{}/containers/json", self.config.endpoint);
        let summaries: Vec<ContainerSummary> = self
            .client
            .get(&url)
            .send()
            .await
            .context("listing containers")?
            .error_for_status()
            .context("listing containers")?
            .json()
            .await
            .context("decoding container list")?;

        Ok(summaries
            .into_iter()
            .filter_map(|summary| {
                let name = summary
                    .names
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(RuntimeContainer {
                    id: summary.id,
                    name,
                })
            })
            .collect())
    }

    async fn sample_stats(&self, container_id: &str) -> Result<StatsSample> {
        let url = format!(
            "{}/containers/{}/stats",
            self.config.endpoint, container_id
        );
        let raw: StatsResponse = self
            .client
            .get(&url)
            .query(&[("stream", "false")])
            .send()
            .await
            .with_context(|| format!("sampling stats for {container_id}"))?
            .error_for_status()
            .with_context(|| format!("sampling stats for {container_id}"))?
            .json()
            .await
            .with_context(|| format!("decoding stats for {container_id}"))?;

        Ok(raw.into())
    }

    async fn subscribe_lifecycle(&self) -> Result<mpsc::Receiver<ContainerLifecycle>> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let client = self.stream_client.clone();
        let endpoint = self.config.endpoint.clone();
        let health = self.health.clone();

        tokio::spawn(async move {
            stream_events(client, endpoint, tx, health).await;
        });

        Ok(rx)
    }
}

/// Follows `/events`, feeding parsed lifecycle events into `tx` until the
/// receiver is dropped
async fn stream_events(
    client: reqwest::Client,
    endpoint: String,
    tx: mpsc::Sender<ContainerLifecycle>,
    health: Option<AgentHealth>,
) {
    let filters = serde_json::json!({
        "type": ["container"],
        "event": ["start", "stop", "die"],
    })
    .to_string();

    loop {
        let request = client
            .get(format!("{endpoint}/events"))
            .query(&[("filters", filters.as_str())]);

        match request.send().await {
            Ok(response) if response.status().is_success() => {
                info!("Connected to runtime event stream");
                if let Some(h) = &health {
                    h.report_ok(components::EVENT_STREAM);
                }

                let mut stream = response.bytes_stream();
                let mut buf: Vec<u8> = Vec::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(bytes) => {
                            buf.extend_from_slice(&bytes);
                            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                                let line: Vec<u8> = buf.drain(..=pos).collect();
                                if let Some(event) = parse_event_line(&line) {
                                    if tx.send(event).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Err(err) => {
                            warn!(error = %err, "Runtime event stream broke");
                            break;
                        }
                    }
                }
            }
            Ok(response) => {
                warn!(status = %response.status(), "Runtime event stream request rejected");
            }
            Err(err) => {
                warn!(error = %err, "Could not open runtime event stream");
            }
        }

        if tx.is_closed() {
            return;
        }
        if let Some(h) = &health {
            h.report_degraded(components::EVENT_STREAM, "reconnecting");
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

fn parse_event_line(line: &[u8]) -> Option<ContainerLifecycle> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }

    let raw: EngineEvent = match serde_json::from_str(text) {
        Ok(parsed) => parsed,
        Err(err) => {
            debug!(error = %err, "Skipping unparseable runtime event");
            return None;
        }
    };

    let action = match raw.action.as_str() {
        "start" => LifecycleAction::Start,
        "stop" => LifecycleAction::Stop,
        "die" => LifecycleAction::Die,
        _ => return None,
    };
    let container_name = raw.actor.attributes.get("name")?.clone();
    let time = Utc
        .timestamp_opt(raw.time, 0)
        .single()
        .unwrap_or_else(Utc::now);

    Some(ContainerLifecycle {
        action,
        container_name,
        container_id: raw.actor.id,
        time,
    })
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Names", default)]
    names: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EngineEvent {
    #[serde(rename = "Action")]
    action: String,
    #[serde(rename = "Actor")]
    actor: EventActor,
    #[serde(default)]
    time: i64,
}

#[derive(Debug, Deserialize)]
struct EventActor {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatsResponse {
    #[serde(default)]
    cpu_stats: CpuStats,
    #[serde(default)]
    precpu_stats: CpuStats,
    #[serde(default)]
    memory_stats: MemoryStats,
    #[serde(default)]
    networks: Option<HashMap<String, NetworkStats>>,
}

#[derive(Debug, Default, Deserialize)]
struct CpuStats {
    #[serde(default)]
    cpu_usage: CpuUsage,
    #[serde(default)]
    system_cpu_usage: Option<u64>,
    #[serde(default)]
    online_cpus: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct CpuUsage {
    #[serde(default)]
    total_usage: u64,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryStats {
    #[serde(default)]
    usage: u64,
    #[serde(default)]
    limit: u64,
}

#[derive(Debug, Default, Deserialize)]
struct NetworkStats {
    #[serde(default)]
    rx_bytes: u64,
    #[serde(default)]
    tx_bytes: u64,
}

impl From<StatsResponse> for StatsSample {
    fn from(raw: StatsResponse) -> Self {
        let to_counters = |stats: &CpuStats| CpuCounters {
            total_usage: stats.cpu_usage.total_usage,
            system_usage: stats.system_cpu_usage.unwrap_or(0),
            online_cpus: stats.online_cpus.unwrap_or(0),
        };

        StatsSample {
            cpu: to_counters(&raw.cpu_stats),
            precpu: to_counters(&raw.precpu_stats),
            memory: MemoryCounters {
                usage: raw.memory_stats.usage,
                limit: raw.memory_stats.limit,
            },
            networks: raw
                .networks
                .unwrap_or_default()
                .into_iter()
                .map(|(iface, stats)| {
                    (
                        iface,
                        NetworkCounters {
                            rx_bytes: stats.rx_bytes,
                            tx_bytes: stats.tx_bytes,
                        },
                    )
                })
                .collect(),
        }
    }
}
