//! Prometheus metrics for the platform monitor
//!
//! All metrics live in the process-global registry and are exposed by the
//! agent's `/metrics` endpoint. Components hold a cheap cloneable handle.

use std::sync::OnceLock;

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Histogram buckets for poll-cycle latencies (in seconds); cycles include
/// probe timeouts of up to 5s, so the range is wider than request latencies
const CYCLE_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

/// Inner metrics structure that holds the actual Prometheus metrics
struct AgentMetricsInner {
    health_cycle_latency_seconds: Histogram,
    metrics_cycle_latency_seconds: Histogram,
    cycles_skipped_total: IntCounterVec,
    containers_monitored: IntGauge,
    sample_errors_total: IntCounter,
    probe_failures_total: IntCounter,
    alerts_fired_total: IntCounter,
    alerts_resolved_total: IntCounter,
    notifications_failed_total: IntCounter,
    events_published_total: IntCounterVec,
    gateway_connections: IntGauge,
    gateway_rejects_total: IntCounterVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            health_cycle_latency_seconds: register_histogram!(
                "platform_monitor_health_cycle_latency_seconds",
                "Time spent running one health-check cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register health_cycle_latency_seconds"),

            metrics_cycle_latency_seconds: register_histogram!(
                "platform_monitor_metrics_cycle_latency_seconds",
                "Time spent running one metrics collection cycle",
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register metrics_cycle_latency_seconds"),

            cycles_skipped_total: register_int_counter_vec!(
                "platform_monitor_cycles_skipped_total",
                "Scheduled cycles skipped because the previous one was still running",
                &["task"]
            )
            .expect("Failed to register cycles_skipped_total"),

            containers_monitored: register_int_gauge!(
                "platform_monitor_containers_monitored",
                "Number of managed containers seen by the last collection cycle"
            )
            .expect("Failed to register containers_monitored"),

            sample_errors_total: register_int_counter!(
                "platform_monitor_sample_errors_total",
                "Total failed per-container stats samples"
            )
            .expect("Failed to register sample_errors_total"),

            probe_failures_total: register_int_counter!(
                "platform_monitor_probe_failures_total",
                "Total failed health-check probes"
            )
            .expect("Failed to register probe_failures_total"),

            alerts_fired_total: register_int_counter!(
                "platform_monitor_alerts_fired_total",
                "Total alerts fired"
            )
            .expect("Failed to register alerts_fired_total"),

            alerts_resolved_total: register_int_counter!(
                "platform_monitor_alerts_resolved_total",
                "Total alerts resolved"
            )
            .expect("Failed to register alerts_resolved_total"),

            notifications_failed_total: register_int_counter!(
                "platform_monitor_notifications_failed_total",
                "Webhook deliveries that failed after the retry"
            )
            .expect("Failed to register notifications_failed_total"),

            events_published_total: register_int_counter_vec!(
                "platform_monitor_events_published_total",
                "Events published on the internal bus",
                &["kind"]
            )
            .expect("Failed to register events_published_total"),

            gateway_connections: register_int_gauge!(
                "platform_monitor_gateway_connections",
                "Currently registered realtime subscriber connections"
            )
            .expect("Failed to register gateway_connections"),

            gateway_rejects_total: register_int_counter_vec!(
                "platform_monitor_gateway_rejects_total",
                "Realtime connections rejected during the handshake",
                &["reason"]
            )
            .expect("Failed to register gateway_rejects_total"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record a health cycle latency observation
    pub fn observe_health_cycle(&self, duration_secs: f64) {
        self.inner().health_cycle_latency_seconds.observe(duration_secs);
    }

    /// Record a metrics cycle latency observation
    pub fn observe_metrics_cycle(&self, duration_secs: f64) {
        self.inner().metrics_cycle_latency_seconds.observe(duration_secs);
    }

    /// Count a cycle skipped by the single-flight guard
    pub fn inc_cycle_skipped(&self, task: &str) {
        self.inner().cycles_skipped_total.with_label_values(&[task]).inc();
    }

    /// Update the managed-container count
    pub fn set_containers_monitored(&self, count: i64) {
        self.inner().containers_monitored.set(count);
    }

    /// Count a failed stats sample
    pub fn inc_sample_errors(&self) {
        self.inner().sample_errors_total.inc();
    }

    /// Count a failed health probe
    pub fn inc_probe_failures(&self) {
        self.inner().probe_failures_total.inc();
    }

    /// Count a fired alert
    pub fn inc_alerts_fired(&self) {
        self.inner().alerts_fired_total.inc();
    }

    /// Count a resolved alert
    pub fn inc_alerts_resolved(&self) {
        self.inner().alerts_resolved_total.inc();
    }

    /// Count a webhook delivery that exhausted its retry
    pub fn inc_notifications_failed(&self) {
        self.inner().notifications_failed_total.inc();
    }

    /// Count a published bus event by kind
    pub fn inc_event_published(&self, kind: &str) {
        self.inner().events_published_total.with_label_values(&[kind]).inc();
    }

    /// Track a registered gateway connection
    pub fn inc_gateway_connections(&self) {
        self.inner().gateway_connections.inc();
    }

    /// Track a deregistered gateway connection
    pub fn dec_gateway_connections(&self) {
        self.inner().gateway_connections.dec();
    }

    /// Count a handshake rejection by reason
    pub fn inc_gateway_rejected(&self, reason: &str) {
        self.inner().gateway_rejects_total.with_label_values(&[reason]).inc();
    }
}
