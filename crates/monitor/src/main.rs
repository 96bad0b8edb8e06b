//! Platform Monitor - observability agent for tenant containers
//!
//! Watches the container runtime for managed workloads, polls their
//! health and resource usage, evaluates alert rules, and serves queries
//! plus a realtime event feed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use monitor_lib::alert::{AlertEngine, AlertHistoryStore};
use monitor_lib::bus::{Event, EventBus};
use monitor_lib::collector::{CollectorConfig, MetricsCollector, MetricsStore};
use monitor_lib::gateway::{GatewayConfig, RealtimeGateway};
use monitor_lib::health::{components, AgentHealth};
use monitor_lib::healthcheck::{HealthMonitor, HealthStateStore};
use monitor_lib::matcher::ContainerMatcher;
use monitor_lib::notify::{ChannelStore, NotificationDispatcher};
use monitor_lib::runtime::{ContainerRuntime, DockerConfig, DockerRuntime};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod auth;
mod config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting platform-monitor");

    let config = config::MonitorConfig::load()?;
    let platform = config.load_platform()?;
    info!(
        prefix = %platform.naming_prefix,
        services = platform.services.len(),
        rules = platform.alert_rules.len(),
        "Platform configuration loaded"
    );

    let health = AgentHealth::new();
    health.register(components::METRICS_COLLECTOR);
    health.register(components::HEALTH_MONITOR);
    health.register(components::ALERT_ENGINE);
    health.register(components::EVENT_STREAM);
    health.register(components::GATEWAY);

    let bus = EventBus::new(config.event_bus_capacity);
    let matcher = ContainerMatcher::new(&platform.naming_prefix, platform.service_names());

    let mut docker = DockerRuntime::new(DockerConfig {
        endpoint: config.docker_endpoint.clone(),
        ..Default::default()
    })?;
    docker.set_health_registry(health.clone());
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(docker);

    let history = AlertHistoryStore::new(config.alert_history_path.clone().map(PathBuf::from));
    history.load().await;
    let channels = ChannelStore::new(config.channels_path.clone().map(PathBuf::from));
    channels.load().await;

    let metrics_store = MetricsStore::new();
    let health_states = HealthStateStore::new();

    let (shutdown_tx, _) = broadcast::channel(1);

    spawn_lifecycle_pump(
        runtime.clone(),
        matcher.clone(),
        bus.clone(),
        health.clone(),
        shutdown_tx.subscribe(),
    );

    let collector = Arc::new(MetricsCollector::new(
        runtime.clone(),
        matcher.clone(),
        metrics_store.clone(),
        bus.clone(),
        health.clone(),
        CollectorConfig {
            interval: Duration::from_secs(config.collection_interval_secs),
            ..Default::default()
        },
    ));
    tokio::spawn(collector.run(shutdown_tx.subscribe()));

    let monitor = HealthMonitor::new(
        runtime.clone(),
        matcher.clone(),
        platform.services.clone(),
        health_states.clone(),
        bus.clone(),
        health.clone(),
    )?;
    if monitor.has_checks() {
        tokio::spawn(Arc::new(monitor).run(shutdown_tx.subscribe()));
    } else {
        info!("No services declare health checks, health monitor not started");
        health.report_ok(components::HEALTH_MONITOR);
    }

    let dispatcher = NotificationDispatcher::new(channels.clone());
    let engine = Arc::new(AlertEngine::new(
        platform.alert_rules.clone(),
        matcher.clone(),
        bus.clone(),
        history.clone(),
        dispatcher,
        health.clone(),
    ));
    tokio::spawn(engine.run(shutdown_tx.subscribe()));

    let secret = config
        .jwt_secret
        .as_deref()
        .context("MONITOR_JWT_SECRET must be set for the realtime gateway")?;
    let gateway = Arc::new(RealtimeGateway::new(
        bus.clone(),
        Arc::new(auth::JwtVerifier::new(secret)),
        GatewayConfig::default(),
    ));
    health.report_ok(components::GATEWAY);

    let app_state = Arc::new(api::AppState {
        health: health.clone(),
        metrics_store,
        health_states,
        history,
        channels,
        gateway,
    });

    health.set_ready(true);

    let api_handle = tokio::spawn(api::serve(
        config.api_port,
        app_state,
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    let _ = shutdown_tx.send(());
    let _ = api_handle.await;

    Ok(())
}

/// Forward runtime lifecycle events for managed containers onto the bus
fn spawn_lifecycle_pump(
    runtime: Arc<dyn ContainerRuntime>,
    matcher: ContainerMatcher,
    bus: EventBus,
    health: AgentHealth,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut stream = match runtime.subscribe_lifecycle().await {
            Ok(stream) => {
                health.report_ok(components::EVENT_STREAM);
                stream
            }
            Err(err) => {
                error!(error = %err, "Failed to subscribe to container lifecycle events");
                health.report_down(components::EVENT_STREAM, "subscribe failed");
                return;
            }
        };

        loop {
            tokio::select! {
                event = stream.recv() => match event {
                    Some(event) => {
                        // containers outside the naming convention are not ours
                        if matcher.identify(&event.container_name).is_some() {
                            bus.publish(Event::Container(event));
                        }
                    }
                    None => {
                        warn!("Container lifecycle stream ended");
                        health.report_down(components::EVENT_STREAM, "stream ended");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutting down lifecycle pump");
                    break;
                }
            }
        }
    });
}
