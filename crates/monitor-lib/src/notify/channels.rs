//! Notification channel registry
//!
//! Holds the configured outbound channels and mirrors them to a single
//! JSON document. Writes go through a temp file and rename so a crash
//! never leaves a half-written list behind; persistence failures are
//! logged and the in-memory list stays authoritative.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::models::{ChannelKind, NotificationChannel};

#[derive(Clone)]
pub struct ChannelStore {
    channels: Arc<RwLock<Vec<NotificationChannel>>>,
    path: Option<PathBuf>,
}

impl ChannelStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            channels: Arc::new(RwLock::new(Vec::new())),
            path,
        }
    }

    /// Seed the list from the JSON document; a missing or unreadable
    /// file starts empty
    pub async fn load(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No channel file, starting empty");
                return;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to read channels, starting empty");
                return;
            }
        };

        match serde_json::from_slice::<Vec<NotificationChannel>>(&raw) {
            Ok(channels) => {
                info!(channels = channels.len(), "Loaded notification channels");
                *self.channels.write().await = channels;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Malformed channel file, starting empty");
            }
        }
    }

    pub async fn list(&self) -> Vec<NotificationChannel> {
        self.channels.read().await.clone()
    }

    pub async fn get(&self, id: &str) -> Option<NotificationChannel> {
        self.channels
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    /// Channels the dispatcher will actually deliver to
    pub async fn enabled_webhooks(&self) -> Vec<NotificationChannel> {
        self.channels
            .read()
            .await
            .iter()
            .filter(|c| c.enabled && c.kind == ChannelKind::Webhook)
            .cloned()
            .collect()
    }

    /// Insert or replace a channel by id
    pub async fn upsert(&self, channel: NotificationChannel) {
        let mut channels = self.channels.write().await;
        match channels.iter_mut().find(|c| c.id == channel.id) {
            Some(existing) => *existing = channel,
            None => channels.push(channel),
        }
        self.persist(&channels).await;
    }

    /// Remove a channel by id; returns whether it existed
    pub async fn remove(&self, id: &str) -> bool {
        let mut channels = self.channels.write().await;
        let before = channels.len();
        channels.retain(|c| c.id != id);
        let removed = channels.len() != before;
        if removed {
            self.persist(&channels).await;
        }
        removed
    }

    async fn persist(&self, channels: &[NotificationChannel]) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(err) = save_atomic(path, channels).await {
            warn!(path = %path.display(), error = %err, "Failed to persist channels");
        }
    }
}

async fn save_atomic(path: &PathBuf, channels: &[NotificationChannel]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {:?}", parent))?;
    }

    let json = serde_json::to_vec_pretty(channels).context("Failed to serialize channels")?;

    let temp_path = path.with_extension("tmp");
    let mut file = tokio::fs::File::create(&temp_path)
        .await
        .with_context(|| format!("Failed to create temp file {:?}", temp_path))?;
    file.write_all(&json)
        .await
        .context("Failed to write channel data")?;
    file.sync_all().await.context("Failed to sync channel file")?;

    tokio::fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

    Ok(())
}
