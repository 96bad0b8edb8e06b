//! Agent self-health tracking
//!
//! Each long-running task (pollers, alert engine, runtime event stream,
//! gateway) reports its status here; the agent's `/healthz` and `/readyz`
//! endpoints serve the aggregate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Status of one agent task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Up,
    Degraded,
    Down,
}

/// Latest report from one agent task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHealth {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskHealth {
    fn up() -> Self {
        Self {
            status: TaskStatus::Up,
            detail: None,
            updated_at: Utc::now(),
        }
    }

    fn degraded(detail: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Degraded,
            detail: Some(detail.into()),
            updated_at: Utc::now(),
        }
    }

    fn down(detail: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Down,
            detail: Some(detail.into()),
            updated_at: Utc::now(),
        }
    }
}

/// Task names used in health reports
pub mod components {
    pub const METRICS_COLLECTOR: &str = "metrics_collector";
    pub const HEALTH_MONITOR: &str = "health_monitor";
    pub const ALERT_ENGINE: &str = "alert_engine";
    pub const EVENT_STREAM: &str = "event_stream";
    pub const GATEWAY: &str = "gateway";
}

/// Aggregate served by `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: TaskStatus,
    pub tasks: HashMap<String, TaskHealth>,
}

/// Readiness served by `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessSnapshot {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared registry the agent's tasks report into
#[derive(Clone, Default)]
pub struct AgentHealth {
    tasks: Arc<DashMap<&'static str, TaskHealth>>,
    ready: Arc<AtomicBool>,
}

impl AgentHealth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task as up before it starts running
    pub fn register(&self, name: &'static str) {
        self.tasks.insert(name, TaskHealth::up());
    }

    pub fn report_ok(&self, name: &'static str) {
        self.tasks.insert(name, TaskHealth::up());
    }

    pub fn report_degraded(&self, name: &'static str, detail: impl Into<String>) {
        self.tasks.insert(name, TaskHealth::degraded(detail));
    }

    pub fn report_down(&self, name: &'static str, detail: impl Into<String>) {
        self.tasks.insert(name, TaskHealth::down(detail));
    }

    /// Flip once startup wiring has completed
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let tasks: HashMap<String, TaskHealth> = self
            .tasks
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect();

        let mut status = TaskStatus::Up;
        for health in tasks.values() {
            match health.status {
                TaskStatus::Down => {
                    status = TaskStatus::Down;
                    break;
                }
                TaskStatus::Degraded => status = TaskStatus::Degraded,
                TaskStatus::Up => {}
            }
        }

        HealthSnapshot { status, tasks }
    }

    pub fn readiness(&self) -> ReadinessSnapshot {
        if !self.ready.load(Ordering::SeqCst) {
            return ReadinessSnapshot {
                ready: false,
                reason: Some("agent still starting".to_string()),
            };
        }
        if self.snapshot().status == TaskStatus::Down {
            return ReadinessSnapshot {
                ready: false,
                reason: Some("a required task is down".to_string()),
            };
        }
        ReadinessSnapshot {
            ready: true,
            reason: None,
        }
    }
}
