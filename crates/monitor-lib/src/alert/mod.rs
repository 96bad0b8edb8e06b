//! Rule-based alert evaluation
//!
//! Event-driven engine with no polling loop of its own: metrics snapshots
//! drive the cpu/memory threshold rules, lifecycle events drive
//! container_down, health changes drive health_check_failed. State is
//! three maps keyed by `(rule id, scope)`:
//! - timers: when a threshold condition first became true
//! - active: alerts fired and not yet resolved
//! - cooldowns: last firing time, suppressing re-fires within the window
//!
//! Firing and resolving each append a history entry, dispatch
//! notifications, and publish on the bus. Resolution is immediate (not
//! duration-gated) and idempotent.

mod history;

pub use history::{AlertHistoryStore, DEFAULT_RECENT_LIMIT, MAX_RECENT_LIMIT};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Event, EventBus};
use crate::health::{components, AgentHealth};
use crate::matcher::ContainerMatcher;
use crate::models::{
    AlertCondition, AlertHistoryEntry, AlertRule, ContainerLifecycle, HealthChange, HealthStatus,
    LifecycleAction, MetricsSample, MetricsSnapshot,
};
use crate::notify::NotificationDispatcher;
use crate::observability::AgentMetrics;

/// State key: one rule applied to one container or tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopeKey {
    rule_id: String,
    scope: String,
}

impl ScopeKey {
    fn new(rule_id: &str, scope: &str) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            scope: scope.to_string(),
        }
    }
}

/// A fired alert awaiting its resolve condition
#[derive(Debug, Clone)]
struct ActiveAlert {
    fired_at: DateTime<Utc>,
    tenant_id: Option<String>,
    container_name: Option<String>,
}

#[derive(Default)]
struct EngineState {
    active: HashMap<ScopeKey, ActiveAlert>,
    cooldowns: HashMap<ScopeKey, Instant>,
    timers: HashMap<ScopeKey, Instant>,
}

pub struct AlertEngine {
    rules: Vec<AlertRule>,
    matcher: ContainerMatcher,
    bus: EventBus,
    history: AlertHistoryStore,
    dispatcher: NotificationDispatcher,
    state: Mutex<EngineState>,
    health: AgentHealth,
    metrics: AgentMetrics,
}

impl AlertEngine {
    pub fn new(
        rules: Vec<AlertRule>,
        matcher: ContainerMatcher,
        bus: EventBus,
        history: AlertHistoryStore,
        dispatcher: NotificationDispatcher,
        health: AgentHealth,
    ) -> Self {
        Self {
            rules,
            matcher,
            bus,
            history,
            dispatcher,
            state: Mutex::new(EngineState::default()),
            health,
            metrics: AgentMetrics::new(),
        }
    }

    /// Consume bus events until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut events = self.bus.subscribe();
        info!(rules = self.rules.len(), "Starting alert engine");
        self.health.report_ok(components::ALERT_ENGINE);

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.handle_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Alert engine fell behind the event bus");
                        self.health
                            .report_degraded(components::ALERT_ENGINE, "event backlog dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Event bus closed, stopping alert engine");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down alert engine");
                    break;
                }
            }
        }
    }

    /// Evaluate a single event against every configured rule
    pub async fn handle_event(self: &Arc<Self>, event: Event) {
        match event {
            Event::Metrics(snapshot) => self.evaluate_metrics(&snapshot).await,
            Event::Health(change) => self.evaluate_health(&change).await,
            Event::Container(lifecycle) => self.evaluate_lifecycle(&lifecycle).await,
            Event::AlertFired(_) | Event::AlertResolved(_) => {}
        }
    }

    async fn evaluate_metrics(&self, snapshot: &MetricsSnapshot) {
        for rule in &self.rules {
            match &rule.condition {
                AlertCondition::CpuThreshold {
                    threshold,
                    duration,
                } => {
                    for sample in &snapshot.containers {
                        self.evaluate_threshold(
                            rule,
                            *threshold,
                            *duration,
                            sample,
                            sample.cpu_percent,
                            "CPU",
                        )
                        .await;
                    }
                }
                AlertCondition::MemoryThreshold {
                    threshold,
                    duration,
                } => {
                    for sample in &snapshot.containers {
                        self.evaluate_threshold(
                            rule,
                            *threshold,
                            *duration,
                            sample,
                            sample.mem_percent,
                            "Memory",
                        )
                        .await;
                    }
                }
                AlertCondition::ContainerDown { .. }
                | AlertCondition::HealthCheckFailed { .. } => {}
            }
        }
    }

    /// Timer-gated threshold check for one rule against one sample
    async fn evaluate_threshold(
        &self,
        rule: &AlertRule,
        threshold: f64,
        duration: Duration,
        sample: &MetricsSample,
        value: f64,
        what: &str,
    ) {
        let key = ScopeKey::new(&rule.id, &sample.name);
        if value > threshold {
            let since = {
                let mut state = self.state.lock().await;
                *state.timers.entry(key).or_insert_with(Instant::now)
            };
            if since.elapsed() >= duration {
                let message = format!(
                    "{} usage for {} at {:.2}% exceeds {}%",
                    what, sample.name, value, threshold
                );
                self.fire(
                    rule,
                    &sample.name,
                    message,
                    Some(sample.tenant_id.clone()),
                    Some(sample.name.clone()),
                )
                .await;
            }
        } else {
            // back at/below threshold: drop the timer and resolve at once
            self.state.lock().await.timers.remove(&key);
            self.resolve(rule, &sample.name).await;
        }
    }

    async fn evaluate_lifecycle(self: &Arc<Self>, event: &ContainerLifecycle) {
        for rule in &self.rules {
            let AlertCondition::ContainerDown { duration } = &rule.condition else {
                continue;
            };
            let key = ScopeKey::new(&rule.id, &event.container_name);

            match event.action {
                LifecycleAction::Start => {
                    self.state.lock().await.timers.remove(&key);
                    self.resolve(rule, &event.container_name).await;
                }
                LifecycleAction::Stop | LifecycleAction::Die => {
                    let marker = Instant::now();
                    self.state.lock().await.timers.insert(key, marker);

                    // one-shot deferred check; a restart in the meantime
                    // replaces or removes the marker and disarms it
                    let engine = Arc::clone(self);
                    let rule = rule.clone();
                    let container = event.container_name.clone();
                    let grace = *duration;
                    tokio::spawn(async move {
                        tokio::time::sleep(grace).await;
                        engine.complete_down_check(&rule, &container, marker).await;
                    });
                }
            }
        }
    }

    /// Deferred half of container_down: fires iff the marker recorded at
    /// stop time is still in place
    async fn complete_down_check(&self, rule: &AlertRule, container: &str, marker: Instant) {
        let key = ScopeKey::new(&rule.id, container);
        let still_down = self.state.lock().await.timers.get(&key) == Some(&marker);
        if !still_down {
            return;
        }

        let tenant_id = self.matcher.identify(container).map(|id| id.tenant_id);
        let message = format!("Container {container} is down");
        self.fire(rule, container, message, tenant_id, Some(container.to_string()))
            .await;
    }

    async fn evaluate_health(&self, change: &HealthChange) {
        for rule in &self.rules {
            let AlertCondition::HealthCheckFailed {
                consecutive_failures,
            } = &rule.condition
            else {
                continue;
            };

            match change.current {
                HealthStatus::Unhealthy
                    if change.consecutive_failures >= *consecutive_failures =>
                {
                    let message = format!(
                        "Health check failing for {} ({} consecutive failures)",
                        change.container_name, change.consecutive_failures
                    );
                    self.fire(
                        rule,
                        &change.container_name,
                        message,
                        Some(change.tenant_id.clone()),
                        Some(change.container_name.clone()),
                    )
                    .await;
                }
                HealthStatus::Healthy => {
                    self.resolve(rule, &change.container_name).await;
                }
                _ => {}
            }
        }
    }

    /// Record, persist, notify, and publish a firing; a no-op within the
    /// rule's cooldown window for this scope
    async fn fire(
        &self,
        rule: &AlertRule,
        scope: &str,
        message: String,
        tenant_id: Option<String>,
        container_name: Option<String>,
    ) {
        let key = ScopeKey::new(&rule.id, scope);
        let fired_at = Utc::now();
        {
            let mut state = self.state.lock().await;
            if let Some(last) = state.cooldowns.get(&key) {
                if last.elapsed() < rule.cooldown {
                    debug!(rule = %rule.id, scope, "Alert suppressed by cooldown");
                    return;
                }
            }
            state.cooldowns.insert(key.clone(), Instant::now());
            state.active.insert(
                key,
                ActiveAlert {
                    fired_at,
                    tenant_id: tenant_id.clone(),
                    container_name: container_name.clone(),
                },
            );
        }

        let entry = AlertHistoryEntry {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            message,
            tenant_id,
            container_name,
            fired_at,
            resolved_at: None,
        };

        info!(rule = %rule.id, scope, severity = ?rule.severity, "Alert fired");
        self.metrics.inc_alerts_fired();
        self.history.record(entry.clone()).await;
        self.dispatcher.dispatch(&entry).await;
        self.bus.publish(Event::AlertFired(Arc::new(entry)));
    }

    /// Counterpart to `fire`; a no-op when nothing is active for the scope
    async fn resolve(&self, rule: &AlertRule, scope: &str) {
        let key = ScopeKey::new(&rule.id, scope);
        let Some(active) = self.state.lock().await.active.remove(&key) else {
            return;
        };

        let entry = AlertHistoryEntry {
            id: Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            message: format!("{} resolved for {}", rule.name, scope),
            tenant_id: active.tenant_id,
            container_name: active.container_name,
            fired_at: active.fired_at,
            resolved_at: Some(Utc::now()),
        };

        info!(rule = %rule.id, scope, "Alert resolved");
        self.metrics.inc_alerts_resolved();
        self.history.record(entry.clone()).await;
        self.dispatcher.dispatch(&entry).await;
        self.bus.publish(Event::AlertResolved(Arc::new(entry)));
    }
}
