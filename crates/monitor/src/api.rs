//! HTTP API: queries, channel CRUD, realtime upgrade, health and metrics

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use monitor_lib::alert::AlertHistoryStore;
use monitor_lib::collector::MetricsStore;
use monitor_lib::gateway::RealtimeGateway;
use monitor_lib::health::{AgentHealth, TaskStatus};
use monitor_lib::healthcheck::HealthStateStore;
use monitor_lib::models::NotificationChannel;
use monitor_lib::notify::{check_url, ChannelStore};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health: AgentHealth,
    pub metrics_store: MetricsStore,
    pub health_states: HealthStateStore,
    pub history: AlertHistoryStore,
    pub channels: ChannelStore,
    pub gateway: Arc<RealtimeGateway>,
}

#[derive(Deserialize)]
struct MetricsQuery {
    app_id: Option<String>,
    tenant_id: Option<String>,
}

#[derive(Deserialize)]
struct AlertsQuery {
    limit: Option<usize>,
}

/// Liveness: 200 while no required task is down
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.health.snapshot();

    let status_code = match snapshot.status {
        TaskStatus::Up | TaskStatus::Degraded => StatusCode::OK,
        TaskStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(snapshot))
}

/// Readiness: 200 once startup wiring completed
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health.readiness();

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Latest sample per container, optionally filtered by app/tenant
async fn latest_metrics(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MetricsQuery>,
) -> impl IntoResponse {
    let samples = state
        .metrics_store
        .latest(query.app_id.as_deref(), query.tenant_id.as_deref())
        .await;
    Json(samples)
}

/// Ring buffer contents for one container, oldest first
async fn metrics_history(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    Json(state.metrics_store.history(&name).await)
}

/// Current container health states
async fn health_states(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health_states.all().await)
}

/// Alert history, most recent first
async fn alert_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    Json(state.history.recent(query.limit).await)
}

async fn list_channels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.channels.list().await)
}

/// Create or replace a channel; the destination is vetted up front so a
/// bad URL is caught at configuration time, not at delivery time
async fn put_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(mut channel): Json<NotificationChannel>,
) -> Response {
    channel.id = id;
    if let Err(err) = check_url(&channel.config.url).await {
        let body = serde_json::json!({ "error": err.to_string() });
        return (StatusCode::BAD_REQUEST, Json(body)).into_response();
    }

    state.channels.upsert(channel.clone()).await;
    (StatusCode::OK, Json(channel)).into_response()
}

async fn delete_channel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> StatusCode {
    if state.channels.remove(&id).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// Realtime subscriber entry point
async fn ws(State(state): State<Arc<AppState>>, upgrade: WebSocketUpgrade) -> Response {
    state.gateway.clone().accept(upgrade)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/metrics", get(latest_metrics))
        .route("/api/v1/metrics/:name/history", get(metrics_history))
        .route("/api/v1/health", get(health_states))
        .route("/api/v1/alerts", get(alert_history))
        .route(
            "/api/v1/channels",
            get(list_channels),
        )
        .route(
            "/api/v1/channels/:id",
            axum::routing::put(put_channel).delete(delete_channel),
        )
        .route("/ws", get(ws))
        .with_state(state)
}

/// Start the API server and run it until shutdown
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
