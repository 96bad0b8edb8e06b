//! Outbound alert notification
//!
//! Fans alert history entries out to the configured webhook channels.
//! Deliveries run as detached tasks so callers never wait on a slow
//! endpoint; each delivery vets its destination via [`safety`], pins the
//! connection to the resolved address, and retries exactly once. A
//! second failure is logged and swallowed.

mod channels;
mod safety;

pub use channels::ChannelStore;
pub use safety::{check_url, is_private_ip, resolve_safe, SafeTarget, UrlSafetyError};

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, warn};

use crate::models::{AlertHistoryEntry, NotificationChannel};
use crate::observability::AgentMetrics;

/// Per-request delivery timeout
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);
/// One initial attempt plus one retry
const MAX_ATTEMPTS: u32 = 2;

/// Fire-and-forget webhook fan-out
#[derive(Clone)]
pub struct NotificationDispatcher {
    channels: ChannelStore,
    metrics: AgentMetrics,
}

impl NotificationDispatcher {
    pub fn new(channels: ChannelStore) -> Self {
        Self {
            channels,
            metrics: AgentMetrics::new(),
        }
    }

    /// Spawn one delivery task per enabled webhook channel and return
    /// immediately; outcomes are only ever logged
    pub async fn dispatch(&self, entry: &AlertHistoryEntry) {
        let channels = self.channels.enabled_webhooks().await;
        for channel in channels {
            let entry = entry.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                deliver_to_channel(channel, entry, metrics).await;
            });
        }
    }
}

async fn deliver_to_channel(
    channel: NotificationChannel,
    entry: AlertHistoryEntry,
    metrics: AgentMetrics,
) {
    let target = match safety::resolve_safe(&channel.config.url).await {
        Ok(target) => target,
        Err(err) => {
            warn!(channel = %channel.name, error = %err, "Webhook destination rejected");
            metrics.inc_notifications_failed();
            return;
        }
    };

    deliver_with_target(&channel, &target, &entry, &metrics).await;
}

/// Attempt loop against an already-vetted target
async fn deliver_with_target(
    channel: &NotificationChannel,
    target: &SafeTarget,
    entry: &AlertHistoryEntry,
    metrics: &AgentMetrics,
) {
    let payload = webhook_payload(channel, entry);

    for attempt in 1..=MAX_ATTEMPTS {
        match send_webhook(channel, target, &payload).await {
            Ok(status) => {
                debug!(
                    channel = %channel.name,
                    status = %status,
                    attempt,
                    "Webhook delivered"
                );
                return;
            }
            Err(err) if attempt < MAX_ATTEMPTS => {
                warn!(
                    channel = %channel.name,
                    error = %err,
                    attempt,
                    "Webhook delivery failed, retrying"
                );
            }
            Err(err) => {
                error!(
                    channel = %channel.name,
                    error = %err,
                    "Webhook delivery failed after retry"
                );
                metrics.inc_notifications_failed();
            }
        }
    }
}

fn webhook_payload(channel: &NotificationChannel, entry: &AlertHistoryEntry) -> serde_json::Value {
    serde_json::json!({
        "channel_id": channel.id,
        "channel_name": channel.name,
        "alert": entry,
        "dispatched_at": Utc::now(),
    })
}

async fn send_webhook(
    channel: &NotificationChannel,
    target: &SafeTarget,
    payload: &serde_json::Value,
) -> Result<reqwest::StatusCode> {
    // pinned to the address vetted at resolve time
    let client = reqwest::Client::builder()
        .timeout(DELIVERY_TIMEOUT)
        .redirect(reqwest::redirect::Policy::none())
        .resolve(&target.host, target.addr)
        .build()?;

    let method = channel
        .config
        .method
        .as_deref()
        .and_then(|m| reqwest::Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
        .unwrap_or(reqwest::Method::POST);

    let mut request = client.request(method, target.url.clone()).json(payload);
    for (name, value) in &channel.config.headers {
        request = request.header(name, value);
    }

    let response = request.send().await?;
    Ok(response.error_for_status()?.status())
}
