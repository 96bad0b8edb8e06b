//! Service health polling
//!
//! Drives the per-container state machine `unknown → healthy ⇄ unhealthy`:
//! each cycle lists the managed containers, concurrently probes the ones
//! whose service declares a health check, rebuilds the state map, and
//! publishes a health:change event only for containers whose status
//! actually transitioned. Containers without a declared check are skipped
//! entirely; containers gone from the listing drop out of the map.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::health::{components, AgentHealth};
use crate::matcher::ContainerMatcher;
use crate::models::{
    CheckProtocol, HealthChange, HealthCheckSpec, HealthState, HealthStatus, ManagedContainer,
    ServiceSpec,
};
use crate::observability::AgentMetrics;
use crate::runtime::ContainerRuntime;

/// Probe timeout, fixed for both protocols
const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
/// Floor for the cycle period regardless of declared intervals
const MIN_CYCLE_INTERVAL: Duration = Duration::from_secs(10);

/// Shared view of current container health states
///
/// Written only by the monitor's cycle; readers get point-in-time copies.
#[derive(Clone, Default)]
pub struct HealthStateStore {
    states: Arc<RwLock<HashMap<String, HealthState>>>,
}

impl HealthStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> HashMap<String, HealthState> {
        self.states.read().await.clone()
    }

    pub async fn get(&self, container_name: &str) -> Option<HealthState> {
        self.states.read().await.get(container_name).cloned()
    }

    async fn replace(&self, next: HashMap<String, HealthState>) {
        *self.states.write().await = next;
    }
}

/// Scheduled health poller
pub struct HealthMonitor {
    runtime: Arc<dyn ContainerRuntime>,
    matcher: ContainerMatcher,
    services: HashMap<String, ServiceSpec>,
    store: HealthStateStore,
    bus: EventBus,
    client: reqwest::Client,
    health: AgentHealth,
    metrics: AgentMetrics,
    cycle_gate: Mutex<()>,
}

impl HealthMonitor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        matcher: ContainerMatcher,
        services: HashMap<String, ServiceSpec>,
        store: HealthStateStore,
        bus: EventBus,
        health: AgentHealth,
    ) -> Result<Self> {
        // redirects are not followed so 3xx statuses count as passing
        let client = reqwest::Client::builder()
            .timeout(CHECK_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("building health probe client")?;

        Ok(Self {
            runtime,
            matcher,
            services,
            store,
            bus,
            client,
            health,
            metrics: AgentMetrics::new(),
            cycle_gate: Mutex::new(()),
        })
    }

    /// Whether any service declares a health check; without one there is
    /// nothing for this task to do
    pub fn has_checks(&self) -> bool {
        self.services
            .values()
            .any(|svc| svc.health_check.is_some())
    }

    /// Cycle period: the minimum declared check interval, floored at 10s
    pub fn cycle_interval(&self) -> Duration {
        self.services
            .values()
            .filter_map(|svc| svc.health_check.as_ref())
            .map(|check| check.interval)
            .min()
            .map(|min| min.max(MIN_CYCLE_INTERVAL))
            .unwrap_or(MIN_CYCLE_INTERVAL)
    }

    /// Run the polling loop until shutdown; the first cycle starts
    /// immediately
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        let period = self.cycle_interval();
        info!(
            interval_secs = period.as_secs(),
            "Starting health monitor loop"
        );

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down health monitor loop");
                    break;
                }
            }
        }
    }

    /// Run one health cycle; a no-op if a cycle is already in flight
    pub async fn run_cycle(&self) {
        let Ok(_guard) = self.cycle_gate.try_lock() else {
            debug!("Health cycle still running, skipping this tick");
            self.metrics.inc_cycle_skipped("health");
            return;
        };

        let started = Instant::now();
        let listed = match self.runtime.list_running().await {
            Ok(listed) => listed,
            Err(err) => {
                warn!(error = %err, "Failed to list containers, skipping health cycle");
                self.health
                    .report_degraded(components::HEALTH_MONITOR, "runtime list failed");
                return;
            }
        };

        let managed = self.matcher.filter(listed);
        let targets: Vec<(ManagedContainer, &HealthCheckSpec, u16)> = managed
            .into_iter()
            .filter_map(|container| {
                let service = self.services.get(&container.service)?;
                let check = service.health_check.as_ref()?;
                let port = check.port.unwrap_or(service.internal_port);
                Some((container, check, port))
            })
            .collect();

        let previous = self.store.all().await;
        let results = join_all(targets.into_iter().map(|(container, check, port)| async move {
            let passed = self.probe(&container.name, check, port).await;
            (container, passed)
        }))
        .await;

        let now = Utc::now();
        let mut next: HashMap<String, HealthState> = HashMap::with_capacity(results.len());
        let mut changes: Vec<HealthChange> = Vec::new();

        for (container, passed) in results {
            let prior = previous.get(&container.name);
            let prior_status = prior.map(|s| s.status).unwrap_or(HealthStatus::Unknown);
            let prior_failures = prior.map(|s| s.consecutive_failures).unwrap_or(0);

            let (status, consecutive_failures) = if passed {
                (HealthStatus::Healthy, 0)
            } else {
                self.metrics.inc_probe_failures();
                (HealthStatus::Unhealthy, prior_failures + 1)
            };

            if status != prior_status {
                changes.push(HealthChange {
                    container_name: container.name.clone(),
                    tenant_id: container.tenant_id.clone(),
                    service: container.service.clone(),
                    previous: prior_status,
                    current: status,
                    consecutive_failures,
                    last_check: now,
                });
            }

            next.insert(
                container.name,
                HealthState {
                    status,
                    consecutive_failures,
                    last_check: now,
                },
            );
        }

        // swap in the rebuilt map before anyone hears about the changes
        self.store.replace(next).await;
        for change in changes {
            info!(
                container = %change.container_name,
                previous = ?change.previous,
                current = ?change.current,
                failures = change.consecutive_failures,
                "Container health changed"
            );
            self.bus.publish(Event::Health(change));
        }

        self.health.report_ok(components::HEALTH_MONITOR);
        self.metrics
            .observe_health_cycle(started.elapsed().as_secs_f64());
    }

    /// Executes one probe; any error or timeout counts as failure
    async fn probe(&self, container_name: &str, check: &HealthCheckSpec, port: u16) -> bool {
        let host = check.host.as_deref().unwrap_or(container_name);
        match check.protocol {
            CheckProtocol::Http => {
                let path = if check.path.starts_with('/') {
                    check.path.clone()
                } else {
                    format!("/{}", check.path)
                };
                let url = format!("http://{host}:{port}{path}");
                match self.client.get(&url).send().await {
                    Ok(response) => {
                        let code = response.status().as_u16();
                        (200..400).contains(&code)
                    }
                    Err(err) => {
                        debug!(container = %container_name, error = %err, "HTTP probe failed");
                        false
                    }
                }
            }
            CheckProtocol::Tcp => {
                match timeout(CHECK_TIMEOUT, TcpStream::connect((host, port))).await {
                    Ok(Ok(_stream)) => true,
                    Ok(Err(err)) => {
                        debug!(container = %container_name, error = %err, "TCP probe failed");
                        false
                    }
                    Err(_) => {
                        debug!(container = %container_name, "TCP probe timed out");
                        false
                    }
                }
            }
        }
    }
}
