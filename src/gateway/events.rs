//! Gateway opcodes and wire-format messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Opcodes
// ---------------------------------------------------------------------------

pub const OP_DISPATCH: u8 = 0;
pub const OP_HEARTBEAT: u8 = 1;
pub const OP_IDENTIFY: u8 = 2;
pub const OP_EVENT: u8 = 4;
pub const OP_ACK: u8 = 5;
pub const OP_HEARTBEAT_ACK: u8 = 6;

// ---------------------------------------------------------------------------
// Server → Client message
// ---------------------------------------------------------------------------

/// A message sent from the server to the client over WebSocket.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayMessage {
    pub op: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    pub d: Value,
}

impl GatewayMessage {
    /// Build a DISPATCH message (op=0).
    pub fn dispatch(event_name: &str, seq: u64, data: Value) -> Self {
        Self {
            op: OP_DISPATCH,
            t: Some(event_name.to_string()),
            s: Some(seq),
            d: data,
        }
    }

    /// Build a HEARTBEAT_ACK message (op=6).
    pub fn heartbeat_ack(seq: u64) -> Self {
        Self {
            op: OP_HEARTBEAT_ACK,
            t: None,
            s: None,
            d: serde_json::json!({ "ack": seq }),
        }
    }

    /// Build an ACK message (op=5) answering a client event that carried an
    /// `ack` correlation id. Denied events always carry a reason.
    pub fn ack(ack_id: u64, allowed: bool, reason: Option<&str>) -> Self {
        let mut d = serde_json::json!({ "ack": ack_id, "allowed": allowed });
        if let Some(reason) = reason {
            d["reason"] = Value::String(reason.to_string());
        }
        Self {
            op: OP_ACK,
            t: None,
            s: None,
            d,
        }
    }
}

// ---------------------------------------------------------------------------
// Client → Server message
// ---------------------------------------------------------------------------

/// A message received from the client over WebSocket.
#[derive(Debug, Deserialize)]
pub struct ClientMessage {
    pub op: u8,
    #[serde(default)]
    pub t: Option<String>,
    #[serde(default)]
    pub d: Value,
    /// Correlation id for an acknowledgment the client wants back.
    #[serde(default)]
    pub ack: Option<u64>,
}

// ---------------------------------------------------------------------------
// IDENTIFY payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct IdentifyPayload {
    /// Session token, for clients that cannot present the session cookie.
    #[serde(default)]
    pub auth: Option<String>,
}

// ---------------------------------------------------------------------------
// HEARTBEAT payload
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    #[serde(default)]
    pub seq: u64,
}

// ---------------------------------------------------------------------------
// Dispatch event types
// ---------------------------------------------------------------------------

/// Event names dispatched to clients.
pub struct EventName;

impl EventName {
    pub const READY: &'static str = "READY";
    pub const PRESENCE_SYNC: &'static str = "PRESENCE_SYNC";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_denial_carries_reason() {
        let msg = GatewayMessage::ack(7, false, Some("too_many_events"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], 5);
        assert_eq!(json["d"]["ack"], 7);
        assert_eq!(json["d"]["allowed"], false);
        assert_eq!(json["d"]["reason"], "too_many_events");
    }

    #[test]
    fn ack_success_has_no_reason() {
        let msg = GatewayMessage::ack(1, true, None);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["d"]["allowed"], true);
        assert!(json["d"].get("reason").is_none());
    }

    #[test]
    fn dispatch_serializes_envelope_fields() {
        let msg = GatewayMessage::dispatch("PRESENCE_SYNC", 3, serde_json::json!({"online": []}));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["op"], 0);
        assert_eq!(json["t"], "PRESENCE_SYNC");
        assert_eq!(json["s"], 3);
    }

    #[test]
    fn client_message_ack_defaults_to_none() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"op": 4, "t": "chat", "d": {"body": "hi"}}"#).unwrap();
        assert_eq!(msg.op, OP_EVENT);
        assert!(msg.ack.is_none());
    }
}
