//! WebSocket upgrade handler and per-connection event loop.
//!
//! The connection lifecycle runs handshake (IDENTIFY within a deadline,
//! token verification, admission control), then registration and the online
//! announce, then the event loop, then the teardown sequence: offline
//! announce while the registry entries are still present, deregistration,
//! rate-window cleanup, admission release.

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{RawQuery, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time;

use crate::auth::mask;
use crate::auth::session::{HandshakeMeta, Identity};
use crate::error::{HandshakeError, CLOSE_PROTOCOL_ERROR, CLOSE_SESSION_TIMEOUT, CLOSE_UNKNOWN_OPCODE};
use crate::AppState;

use super::admission::Admission;
use super::events::{
    ClientMessage, EventName, GatewayMessage, HeartbeatPayload, IdentifyPayload, OP_EVENT,
    OP_HEARTBEAT, OP_IDENTIFY,
};
use super::limiter::RateDecision;
use super::session::ConnectionHandle;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/healthz", get(healthz))
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let meta = HandshakeMeta::from_request(&headers, query.as_deref(), &state.config.session_cookie);
    ws.on_upgrade(move |socket| handle_connection(socket, state, meta))
}

async fn handle_connection(socket: WebSocket, state: AppState, meta: HandshakeMeta) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let identity = match handshake(&state, &meta, &mut ws_rx).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::debug!(reason = err.reason(), "handshake rejected");
            let _ = send_close(&mut ws_tx, err.close_code(), err.reason()).await;
            return;
        }
    };

    // Admitted → Active: register under both ids, announce, send READY.
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(
        identity.external_id.clone(),
        identity.internal_id.clone(),
        outbound_tx,
    );
    state.registry.register(handle.clone());

    tracing::info!(
        conn = %handle.id(),
        user = %mask(handle.external_id()),
        online = state.registry.online_count(),
        "connection established"
    );

    handle.dispatch(
        EventName::READY,
        serde_json::json!({
            "connection_id": handle.id().to_string(),
            "user": { "id": handle.external_id() },
            "connected_at": handle.connected_at().to_rfc3339(),
            "heartbeat_interval": state.config.heartbeat_interval.as_millis() as u64,
        }),
    );

    state.presence.announce(handle.external_id(), true).await;

    run_connection(&state, &handle, ws_tx, ws_rx, outbound_rx).await;

    // Closing: de-announce while the registry entries are still present so
    // the remaining matches' views are computed against live state, then
    // tear everything down.
    state.presence.announce(handle.external_id(), false).await;
    state
        .registry
        .deregister(handle.external_id(), handle.internal_id(), handle.id());
    state.limiter.remove_all(handle.id());
    state.admission.release(handle.external_id());

    tracing::info!(
        conn = %handle.id(),
        user = %mask(handle.external_id()),
        online = state.registry.online_count(),
        "connection closed"
    );
}

/// Wait for IDENTIFY, verify the session token, and pass admission control.
/// No registry mutation happens in here; a failure leaves no trace.
async fn handshake(
    state: &AppState,
    meta: &HandshakeMeta,
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<Identity, HandshakeError> {
    let identify = time::timeout(state.config.handshake_timeout, read_identify(ws_rx))
        .await
        .map_err(|_| HandshakeError::Timeout)??;

    let identity = state
        .verifier
        .verify(meta, identify.auth.as_deref())
        .map_err(HandshakeError::Auth)?;

    match state.admission.admit(&identity.external_id) {
        Admission::Allow => Ok(identity),
        Admission::Deny => {
            tracing::info!(
                user = %mask(&identity.external_id),
                "connection denied: too many recent attempts"
            );
            Err(HandshakeError::AdmissionDenied)
        }
    }
}

/// Read frames until the client's IDENTIFY arrives.
async fn read_identify(
    ws_rx: &mut SplitStream<WebSocket>,
) -> Result<IdentifyPayload, HandshakeError> {
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                tracing::debug!(?e, "ws read error during identify");
                return Err(HandshakeError::Protocol("read_error"));
            }
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return Err(HandshakeError::Protocol("client_closed")),
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => continue,
        };

        let client_msg: ClientMessage = serde_json::from_str(&text)
            .map_err(|_| HandshakeError::Protocol("invalid_json"))?;

        if client_msg.op != OP_IDENTIFY {
            return Err(HandshakeError::NotIdentified);
        }

        let payload: IdentifyPayload = serde_json::from_value(client_msg.d)
            .map_err(|_| HandshakeError::Protocol("invalid_identify_payload"))?;
        return Ok(payload);
    }
    Err(HandshakeError::Protocol("closed_before_identify"))
}

/// Main event loop: gate inbound events, flush queued dispatches, enforce
/// the heartbeat deadline. Events stay FIFO per connection because this is
/// the only reader.
async fn run_connection(
    state: &AppState,
    handle: &ConnectionHandle,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut ws_rx: SplitStream<WebSocket>,
    mut outbound_rx: mpsc::UnboundedReceiver<GatewayMessage>,
) {
    // Client must heartbeat within 1.5x the advertised interval.
    let heartbeat_deadline = state.config.heartbeat_interval * 3 / 2;
    let mut heartbeat_timer = time::interval(heartbeat_deadline);
    heartbeat_timer.tick().await; // First tick fires immediately; skip it.
    let mut got_heartbeat = true;

    loop {
        tokio::select! {
            // Client sends us a frame.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg: ClientMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(_) => {
                                let _ = send_close(&mut ws_tx, CLOSE_PROTOCOL_ERROR, "invalid_json").await;
                                break;
                            }
                        };

                        match client_msg.op {
                            OP_HEARTBEAT => {
                                got_heartbeat = true;
                                let payload: HeartbeatPayload =
                                    serde_json::from_value(client_msg.d).unwrap_or(HeartbeatPayload { seq: 0 });
                                let ack = GatewayMessage::heartbeat_ack(payload.seq);
                                let json = serde_json::to_string(&ack).unwrap();
                                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                    break;
                                }
                            }
                            OP_EVENT => {
                                if !handle_event(state, handle, client_msg, &mut ws_tx).await {
                                    break;
                                }
                            }
                            OP_IDENTIFY => {
                                let _ = send_close(&mut ws_tx, CLOSE_PROTOCOL_ERROR, "already_identified").await;
                                break;
                            }
                            _ => {
                                let _ = send_close(&mut ws_tx, CLOSE_UNKNOWN_OPCODE, "unknown_opcode").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(?e, conn = %handle.id(), "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Queued dispatch from presence or business logic.
            queued = outbound_rx.recv() => {
                match queued {
                    Some(msg) => {
                        let json = serde_json::to_string(&msg).unwrap();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Heartbeat deadline check.
            _ = heartbeat_timer.tick() => {
                if !got_heartbeat {
                    tracing::debug!(conn = %handle.id(), "heartbeat timeout");
                    let _ = send_close(&mut ws_tx, CLOSE_SESSION_TIMEOUT, "heartbeat_timeout").await;
                    break;
                }
                got_heartbeat = false;
            }
        }
    }
}

/// Gate one named event through the rate limiter and hand it to the sink.
/// Returns false when the socket is dead and the loop should exit.
async fn handle_event(
    state: &AppState,
    handle: &ConnectionHandle,
    msg: ClientMessage,
    ws_tx: &mut SplitSink<WebSocket, Message>,
) -> bool {
    let Some(event) = msg.t.as_deref() else {
        return send_ack(ws_tx, msg.ack, false, Some("missing_event_name")).await;
    };

    let payload_bytes = msg.d.to_string().len();

    match state.limiter.check(handle.id(), event, payload_bytes) {
        RateDecision::Allow => {
            state.sink.handle(handle, event, msg.d).await;
            send_ack(ws_tx, msg.ack, true, None).await
        }
        RateDecision::Deny(reason) => {
            tracing::debug!(
                conn = %handle.id(),
                event,
                reason = reason.as_str(),
                "event rate limited"
            );
            send_ack(ws_tx, msg.ack, false, Some(reason.as_str())).await
        }
    }
}

/// Acknowledge the sender when they asked for it. Returns false on a dead
/// socket.
async fn send_ack(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    ack: Option<u64>,
    allowed: bool,
    reason: Option<&'static str>,
) -> bool {
    let Some(ack_id) = ack else {
        return true;
    };
    let msg = GatewayMessage::ack(ack_id, allowed, reason);
    let json = serde_json::to_string(&msg).unwrap();
    ws_tx.send(Message::Text(json.into())).await.is_ok()
}

/// Send a WebSocket close frame with a code and reason.
async fn send_close(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
