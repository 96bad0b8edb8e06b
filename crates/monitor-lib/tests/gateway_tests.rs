//! Gateway tests over real sockets
//!
//! Spins up an axum server with the gateway mounted at /ws and drives it
//! with a plain WebSocket client, covering the handshake close codes,
//! the per-principal connection limit, and event relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{State, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use monitor_lib::bus::{Event, EventBus};
use monitor_lib::gateway::{
    AuthError, AuthVerifier, GatewayConfig, Principal, RealtimeGateway, CLOSE_AUTH_TIMEOUT,
    CLOSE_INVALID, CLOSE_TOO_MANY,
};
use monitor_lib::models::{HealthChange, HealthStatus};

type WsClient =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct StubVerifier;

impl AuthVerifier for StubVerifier {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        match token {
            "valid-alice" => Ok(Principal {
                subject: "alice".to_string(),
            }),
            "valid-bob" => Ok(Principal {
                subject: "bob".to_string(),
            }),
            "expired" => Err(AuthError::Expired),
            _ => Err(AuthError::Invalid),
        }
    }
}

async fn start_gateway(config: GatewayConfig) -> (SocketAddr, EventBus, Arc<RealtimeGateway>) {
    let bus = EventBus::new(64);
    let gateway = Arc::new(RealtimeGateway::new(
        bus.clone(),
        Arc::new(StubVerifier),
        config,
    ));

    let app = Router::new()
        .route("/ws", get(ws_route))
        .with_state(gateway.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, bus, gateway)
}

async fn ws_route(
    State(gateway): State<Arc<RealtimeGateway>>,
    upgrade: WebSocketUpgrade,
) -> axum::response::Response {
    gateway.accept(upgrade)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    socket
}

async fn authenticate(socket: &mut WsClient, token: &str) {
    socket
        .send(Message::Text(format!(
            r#"{{"type":"auth","token":"{token}"}}"#
        )))
        .await
        .unwrap();
    let ack = socket.next().await.unwrap().unwrap();
    assert_eq!(ack.to_text().unwrap(), r#"{"type":"auth:ok"}"#);
}

async fn expect_close(socket: &mut WsClient, code: u16) -> String {
    loop {
        match socket.next().await {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), code);
                return frame.reason.to_string();
            }
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
}

fn health_event() -> Event {
    Event::Health(HealthChange {
        container_name: "plat-shop-acme-web-1".to_string(),
        tenant_id: "acme".to_string(),
        service: "web".to_string(),
        previous: HealthStatus::Unknown,
        current: HealthStatus::Healthy,
        consecutive_failures: 0,
        last_check: Utc::now(),
    })
}

async fn next_text(socket: &mut WsClient) -> String {
    loop {
        match socket.next().await.unwrap().unwrap() {
            Message::Text(text) => return text,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_silent_client_is_closed_with_4001() {
    let config = GatewayConfig {
        auth_timeout: Duration::from_millis(200),
        ..Default::default()
    };
    let (addr, _bus, _gateway) = start_gateway(config).await;

    let mut socket = connect(addr).await;
    let reason = expect_close(&mut socket, CLOSE_AUTH_TIMEOUT).await;
    assert_eq!(reason, "authentication timeout");
}

#[tokio::test]
async fn test_rejected_tokens_close_with_4003() {
    let (addr, _bus, _gateway) = start_gateway(GatewayConfig::default()).await;

    let mut socket = connect(addr).await;
    socket
        .send(Message::Text(
            r#"{"type":"auth","token":"garbage"}"#.to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(expect_close(&mut socket, CLOSE_INVALID).await, "invalid token");

    // expired is the same code with a distinguishing reason
    let mut socket = connect(addr).await;
    socket
        .send(Message::Text(
            r#"{"type":"auth","token":"expired"}"#.to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(expect_close(&mut socket, CLOSE_INVALID).await, "token expired");
}

#[tokio::test]
async fn test_malformed_first_message_closes_with_4003() {
    let (addr, _bus, _gateway) = start_gateway(GatewayConfig::default()).await;

    let mut socket = connect(addr).await;
    socket
        .send(Message::Text("hello there".to_string()))
        .await
        .unwrap();
    assert_eq!(
        expect_close(&mut socket, CLOSE_INVALID).await,
        "expected auth message"
    );
}

#[tokio::test]
async fn test_sixth_connection_for_principal_is_rejected() {
    let (addr, _bus, gateway) = start_gateway(GatewayConfig::default()).await;

    let mut sockets = Vec::new();
    for _ in 0..5 {
        let mut socket = connect(addr).await;
        authenticate(&mut socket, "valid-alice").await;
        sockets.push(socket);
    }
    assert_eq!(gateway.registry().count("alice"), 5);

    let mut sixth = connect(addr).await;
    sixth
        .send(Message::Text(
            r#"{"type":"auth","token":"valid-alice"}"#.to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(
        expect_close(&mut sixth, CLOSE_TOO_MANY).await,
        "too many connections"
    );

    // other principals are unaffected by alice's limit
    let mut other = connect(addr).await;
    authenticate(&mut other, "valid-bob").await;

    // a freed slot admits a new connection
    drop(sockets.pop());
    tokio::time::sleep(Duration::from_millis(200)).await;
    let mut replacement = connect(addr).await;
    authenticate(&mut replacement, "valid-alice").await;
    assert_eq!(gateway.registry().count("alice"), 5);
}

#[tokio::test]
async fn test_relays_envelopes_after_auth() {
    let (addr, bus, _gateway) = start_gateway(GatewayConfig::default()).await;

    let mut socket = connect(addr).await;
    authenticate(&mut socket, "valid-alice").await;

    bus.publish(health_event());

    let text = next_text(&mut socket).await;
    let envelope: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(envelope["type"], "health:change");
    assert!(envelope["timestamp"].is_string());
    assert_eq!(envelope["data"]["container_name"], "plat-shop-acme-web-1");
    assert_eq!(envelope["data"]["current"], "healthy");
}

#[tokio::test]
async fn test_client_chatter_after_handshake_is_ignored() {
    let (addr, bus, _gateway) = start_gateway(GatewayConfig::default()).await;

    let mut socket = connect(addr).await;
    authenticate(&mut socket, "valid-alice").await;

    socket
        .send(Message::Text(r#"{"type":"subscribe","to":"*"}"#.to_string()))
        .await
        .unwrap();

    // still connected and still receiving
    bus.publish(health_event());
    let envelope: serde_json::Value = serde_json::from_str(&next_text(&mut socket).await).unwrap();
    assert_eq!(envelope["type"], "health:change");
}

#[tokio::test]
async fn test_unresponsive_connection_is_dropped() {
    let config = GatewayConfig {
        ping_interval: Duration::from_millis(150),
        ..Default::default()
    };
    let (addr, _bus, gateway) = start_gateway(config).await;

    let mut socket = connect(addr).await;
    authenticate(&mut socket, "valid-alice").await;
    assert_eq!(gateway.registry().count("alice"), 1);

    // never read again: pongs are only produced by reading, so the
    // second ping tick finds the first unanswered
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(gateway.registry().count("alice"), 0);
}

#[tokio::test]
async fn test_responsive_connection_survives_pings() {
    let config = GatewayConfig {
        ping_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let (addr, bus, gateway) = start_gateway(config).await;

    let mut socket = connect(addr).await;
    authenticate(&mut socket, "valid-alice").await;

    // keep reading across several ping rounds; the client answers pings
    // as a side effect of reading
    let deadline = tokio::time::Instant::now() + Duration::from_millis(450);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(50), socket.next()).await {
            Ok(Some(Ok(_))) => {}
            Ok(_) => panic!("connection closed during ping rounds"),
            Err(_) => {}
        }
    }

    assert_eq!(gateway.registry().count("alice"), 1);
    bus.publish(health_event());
    let envelope: serde_json::Value = serde_json::from_str(&next_text(&mut socket).await).unwrap();
    assert_eq!(envelope["type"], "health:change");
}
