//! Realtime event gateway
//!
//! WebSocket fan-out of the event bus to authenticated subscribers:
//! - first message must be `{"type":"auth","token":...}` within 5s
//! - close codes: 4001 auth timeout, 4003 invalid token or message,
//!   4029 too many connections for the principal
//! - after the `{"type":"auth:ok"}` ack, traffic is strictly
//!   server-to-client envelopes `{type, timestamp, data}`
//! - a ping every 30s; a connection that missed the previous pong is
//!   dropped

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::bus::{Event, EventBus};
use crate::observability::AgentMetrics;

/// Close code: no valid auth message within the timeout
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
/// Close code: malformed first message or rejected token
pub const CLOSE_INVALID: u16 = 4003;
/// Close code: principal already at its connection limit
pub const CLOSE_TOO_MANY: u16 = 4029;

/// Only the handshake is ever client-initiated, so inbound frames are
/// capped small
const MAX_INBOUND_BYTES: usize = 4 * 1024;

/// Why a presented credential was rejected
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("invalid token")]
    Invalid,
}

/// The identity behind an accepted credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

/// Credential verification capability supplied by the embedding server
pub trait AuthVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub auth_timeout: Duration,
    pub ping_interval: Duration,
    pub max_connections_per_principal: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            max_connections_per_principal: 5,
        }
    }
}

/// Per-principal connection counting; register and release are atomic so
/// the limit is exact under concurrent handshakes
#[derive(Clone)]
pub struct ConnectionRegistry {
    counts: Arc<DashMap<String, usize>>,
    limit: usize,
}

impl ConnectionRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            counts: Arc::new(DashMap::new()),
            limit,
        }
    }

    /// Claim a slot for the subject; false when the limit is reached
    pub fn try_register(&self, subject: &str) -> bool {
        let mut entry = self.counts.entry(subject.to_string()).or_insert(0);
        if *entry >= self.limit {
            return false;
        }
        *entry += 1;
        true
    }

    pub fn release(&self, subject: &str) {
        let now_empty = match self.counts.get_mut(subject) {
            Some(mut entry) => {
                *entry = entry.saturating_sub(1);
                *entry == 0
            }
            None => false,
        };
        if now_empty {
            self.counts.remove_if(subject, |_, count| *count == 0);
        }
    }

    pub fn count(&self, subject: &str) -> usize {
        self.counts.get(subject).map(|entry| *entry).unwrap_or(0)
    }
}

pub struct RealtimeGateway {
    bus: EventBus,
    verifier: Arc<dyn AuthVerifier>,
    registry: ConnectionRegistry,
    config: GatewayConfig,
    metrics: AgentMetrics,
}

impl RealtimeGateway {
    pub fn new(bus: EventBus, verifier: Arc<dyn AuthVerifier>, config: GatewayConfig) -> Self {
        let registry = ConnectionRegistry::new(config.max_connections_per_principal);
        Self {
            bus,
            verifier,
            registry,
            config,
            metrics: AgentMetrics::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Turn an HTTP upgrade into a gateway-managed socket
    pub fn accept(self: Arc<Self>, upgrade: WebSocketUpgrade) -> axum::response::Response {
        upgrade
            .max_message_size(MAX_INBOUND_BYTES)
            .on_upgrade(move |socket| async move {
                self.handle_socket(socket).await;
            })
    }

    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sender, mut receiver) = socket.split();

        let subject = match self.authenticate(&mut sender, &mut receiver).await {
            Some(subject) => subject,
            None => return,
        };

        // subscribe before the ack goes out so nothing published after
        // the client sees auth:ok can be missed
        let events = self.bus.subscribe();
        let ack = serde_json::json!({ "type": "auth:ok" }).to_string();
        if sender.send(Message::Text(ack)).await.is_err() {
            self.registry.release(&subject);
            return;
        }

        info!(subject = %subject, "Realtime subscriber connected");
        self.metrics.inc_gateway_connections();
        self.relay(&mut sender, &mut receiver, events, &subject).await;

        self.registry.release(&subject);
        self.metrics.dec_gateway_connections();
        info!(subject = %subject, "Realtime subscriber disconnected");
    }

    /// Handshake: one auth message, verified and admitted against the
    /// per-principal limit. Returns the registered subject.
    async fn authenticate(
        &self,
        sender: &mut SplitSink<WebSocket, Message>,
        receiver: &mut SplitStream<WebSocket>,
    ) -> Option<String> {
        let first = match timeout(self.config.auth_timeout, receiver.next()).await {
            Err(_) => {
                self.metrics.inc_gateway_rejected("timeout");
                close_with(sender, CLOSE_AUTH_TIMEOUT, "authentication timeout").await;
                return None;
            }
            Ok(Some(Ok(message))) => message,
            // client went away before authenticating
            Ok(_) => return None,
        };

        let token = match &first {
            Message::Text(text) => parse_auth_token(text),
            _ => None,
        };
        let Some(token) = token else {
            self.metrics.inc_gateway_rejected("malformed");
            close_with(sender, CLOSE_INVALID, "expected auth message").await;
            return None;
        };

        let principal = match self.verifier.verify(&token) {
            Ok(principal) => principal,
            Err(AuthError::Expired) => {
                self.metrics.inc_gateway_rejected("expired");
                close_with(sender, CLOSE_INVALID, "token expired").await;
                return None;
            }
            Err(AuthError::Invalid) => {
                self.metrics.inc_gateway_rejected("invalid");
                close_with(sender, CLOSE_INVALID, "invalid token").await;
                return None;
            }
        };

        if !self.registry.try_register(&principal.subject) {
            warn!(subject = %principal.subject, "Connection limit reached");
            self.metrics.inc_gateway_rejected("limit");
            close_with(sender, CLOSE_TOO_MANY, "too many connections").await;
            return None;
        }

        Some(principal.subject)
    }

    /// Push envelopes until the client goes away or fails a ping round
    async fn relay(
        &self,
        sender: &mut SplitSink<WebSocket, Message>,
        receiver: &mut SplitStream<WebSocket>,
        mut events: tokio::sync::broadcast::Receiver<Event>,
        subject: &str,
    ) {
        let mut ping = interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the immediate first tick is not a liveness probe
        ping.tick().await;
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        let text = envelope(&event).to_string();
                        if sender.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(subject = %subject, missed, "Subscriber fell behind, events dropped");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = ping.tick() => {
                    if awaiting_pong {
                        warn!(subject = %subject, "No pong since last ping, dropping connection");
                        return;
                    }
                    awaiting_pong = true;
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        return;
                    }
                }
                incoming = receiver.next() => match incoming {
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Ok(other)) => {
                        // no client input is expected after the handshake
                        debug!(subject = %subject, kind = message_kind(&other), "Ignoring client message");
                    }
                    Some(Err(_)) => return,
                }
            }
        }
    }
}

/// Wrap a bus event for the wire
fn envelope(event: &Event) -> serde_json::Value {
    serde_json::json!({
        "type": event.kind(),
        "timestamp": Utc::now(),
        "data": event.payload(),
    })
}

fn parse_auth_token(text: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "auth" {
        return None;
    }
    value.get("token")?.as_str().map(str::to_string)
}

fn message_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
    }
}

async fn close_with(sender: &mut SplitSink<WebSocket, Message>, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: Cow::Borrowed(reason),
    };
    let _ = sender.send(Message::Close(Some(frame))).await;
}
