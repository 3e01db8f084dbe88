//! Shared helpers for gateway integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use tokio::time;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

use amica_gateway::auth::session::SessionClaims;
use amica_gateway::config::{Config, Profile};
use amica_gateway::gateway::matches::StaticMatchDirectory;
use amica_gateway::gateway::session::ConnectionHandle;
use amica_gateway::gateway::sink::EventSink;
use amica_gateway::AppState;

pub const TEST_SECRET: &str = "gateway-test-secret";

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Sink that records events clearing the rate-limit gate.
#[derive(Default)]
pub struct RecordingSink {
    pub events: parking_lot::Mutex<Vec<(String, String)>>,
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn handle(&self, conn: &ConnectionHandle, event: &str, _data: serde_json::Value) {
        self.events
            .lock()
            .push((conn.external_id().to_string(), event.to_string()));
    }
}

pub struct TestApp {
    pub addr: SocketAddr,
    pub state: AppState,
    pub directory: Arc<StaticMatchDirectory>,
    pub sink: Arc<RecordingSink>,
}

/// Development-profile config pointed at an unused core API.
pub fn test_config() -> Config {
    let mut config = Config::for_profile(
        Profile::Development,
        TEST_SECRET.to_string(),
        "http://core.invalid".to_string(),
    );
    config.handshake_timeout = Duration::from_secs(5);
    config
}

/// Start a gateway on an ephemeral port with an in-memory match directory
/// and a recording sink. The server runs in the background.
pub async fn spawn_app(config: Config) -> TestApp {
    let directory = Arc::new(StaticMatchDirectory::new());
    let sink = Arc::new(RecordingSink::default());
    let state = AppState::new(config, directory.clone(), sink.clone());

    let app = amica_gateway::gateway::server::router().with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestApp {
        addr,
        state,
        directory,
        sink,
    }
}

pub fn mint_token(external_id: &str, internal_id: &str) -> String {
    mint_token_with(external_id, internal_id, 300, TEST_SECRET)
}

pub fn mint_token_with(
    external_id: &str,
    internal_id: &str,
    exp_offset: i64,
    secret: &str,
) -> String {
    let now = Utc::now().timestamp();
    let claims = SessionClaims {
        sub: external_id.to_string(),
        uid: internal_id.to_string(),
        iat: now,
        exp: now + exp_offset,
        nbf: Some(now),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

/// Open a WebSocket to the gateway.
pub async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway"))
        .await
        .expect("ws connect");
    ws
}

/// Open a WebSocket with a session cookie on the upgrade request.
pub async fn connect_with_cookie(addr: SocketAddr, cookie_name: &str, token: &str) -> WsStream {
    let mut request = format!("ws://{addr}/gateway")
        .into_client_request()
        .expect("client request");
    request.headers_mut().insert(
        "Cookie",
        format!("{cookie_name}={token}").parse().unwrap(),
    );
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    ws
}

/// Open a WebSocket with a token in the query string (a path the gateway
/// must refuse to honor).
pub async fn connect_with_query_token(addr: SocketAddr, token: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/gateway?token={token}"))
        .await
        .expect("ws connect");
    ws
}

/// Read the next text frame as JSON, failing on timeout or close.
pub async fn next_json(ws: &mut WsStream, secs: u64) -> serde_json::Value {
    let msg = time::timeout(Duration::from_secs(secs), ws.next())
        .await
        .expect("timeout waiting for frame")
        .expect("stream ended")
        .expect("ws read error");
    let text = msg.into_text().expect("not a text frame");
    serde_json::from_str(&text).expect("parse frame")
}

/// Assert that no frame arrives for a short while.
pub async fn expect_silence(ws: &mut WsStream) {
    let result = time::timeout(Duration::from_millis(500), ws.next()).await;
    assert!(result.is_err(), "expected no frame, got: {result:?}");
}

/// Read until a close frame arrives and assert its code.
pub async fn expect_close(ws: &mut WsStream, expected_code: u16) {
    let msg = time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timeout waiting for close")
        .expect("stream ended")
        .expect("ws read error");

    match msg {
        tungstenite::Message::Close(Some(frame)) => {
            assert_eq!(
                frame.code,
                tungstenite::protocol::frame::coding::CloseCode::from(expected_code)
            );
        }
        tungstenite::Message::Close(None) => {
            // Also acceptable.
        }
        other => panic!("expected close frame, got: {other:?}"),
    }
}

/// Send IDENTIFY (optionally with an `auth` token) and read READY.
pub async fn identify(ws: &mut WsStream, auth: Option<&str>) -> serde_json::Value {
    let d = match auth {
        Some(token) => serde_json::json!({ "auth": token }),
        None => serde_json::json!({}),
    };
    let frame = serde_json::json!({ "op": 2, "d": d });
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send identify");

    let ready = next_json(ws, 5).await;
    assert_eq!(ready["op"], 0, "READY should be op=0 (DISPATCH)");
    assert_eq!(ready["t"], "READY");
    ready
}

/// Read the PRESENCE_SYNC dispatch and return its online list.
pub async fn read_presence_sync(ws: &mut WsStream) -> Vec<String> {
    let msg = next_json(ws, 5).await;
    assert_eq!(msg["op"], 0);
    assert_eq!(msg["t"], "PRESENCE_SYNC");
    msg["d"]["online"]
        .as_array()
        .expect("online list")
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect()
}

/// Send a named EVENT frame with an ack id and return the ACK payload.
pub async fn send_event_with_ack(
    ws: &mut WsStream,
    event: &str,
    data: serde_json::Value,
    ack_id: u64,
) -> serde_json::Value {
    let frame = serde_json::json!({ "op": 4, "t": event, "d": data, "ack": ack_id });
    ws.send(tungstenite::Message::Text(frame.to_string().into()))
        .await
        .expect("send event");

    let ack = next_json(ws, 5).await;
    assert_eq!(ack["op"], 5, "expected ACK");
    assert_eq!(ack["d"]["ack"], ack_id);
    ack
}
