//! Alert history retention
//!
//! Bounded in-memory log of fired and resolved alerts, mirrored to an
//! append-only JSONL file when a path is configured. Persistence is best
//! effort: a write failure is logged and the in-memory log stays
//! authoritative.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::models::AlertHistoryEntry;

/// Most entries kept in memory
const MAX_MEMORY_ENTRIES: usize = 1000;
/// Default page size for `recent`
pub const DEFAULT_RECENT_LIMIT: usize = 100;
/// Hard cap on the page size for `recent`
pub const MAX_RECENT_LIMIT: usize = 500;

/// Append-only alert log, oldest entries evicted first
#[derive(Clone)]
pub struct AlertHistoryStore {
    entries: Arc<RwLock<VecDeque<AlertHistoryEntry>>>,
    path: Option<PathBuf>,
}

impl AlertHistoryStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(VecDeque::new())),
            path,
        }
    }

    /// Seed the in-memory log from the JSONL file, keeping the most
    /// recent entries; malformed lines are skipped
    pub async fn load(&self) {
        let Some(path) = &self.path else {
            return;
        };

        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No alert history file, starting empty");
                return;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to read alert history");
                return;
            }
        };

        let mut loaded: VecDeque<AlertHistoryEntry> = VecDeque::new();
        let mut skipped = 0usize;
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AlertHistoryEntry>(line) {
                Ok(entry) => {
                    if loaded.len() >= MAX_MEMORY_ENTRIES {
                        loaded.pop_front();
                    }
                    loaded.push_back(entry);
                }
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(skipped, "Skipped malformed alert history lines");
        }

        info!(entries = loaded.len(), "Loaded alert history");
        *self.entries.write().await = loaded;
    }

    /// Record an entry in memory and append it to the JSONL file
    pub async fn record(&self, entry: AlertHistoryEntry) {
        {
            let mut entries = self.entries.write().await;
            if entries.len() >= MAX_MEMORY_ENTRIES {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }

        let Some(path) = &self.path else {
            return;
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(err) => {
                error!(error = %err, "Failed to serialize alert history entry");
                return;
            }
        };

        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(err) = result {
            error!(path = %path.display(), error = %err, "Failed to append alert history");
        }
    }

    /// Most recent entries first; `limit` defaults to 100, capped at 500
    pub async fn recent(&self, limit: Option<usize>) -> Vec<AlertHistoryEntry> {
        let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT).min(MAX_RECENT_LIMIT);
        self.entries
            .read()
            .await
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }
}
