//! Per-connection state and the handle other subsystems deliver through.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use super::events::GatewayMessage;

/// Process-local connection identifier, unique per transport-level session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Handle to a live connection. Cloneable and cheap; the registry stores it
/// and the chat/match services receive it from socket lookup.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    external_id: String,
    internal_id: String,
    connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<GatewayMessage>,
    /// Monotonically increasing sequence number for dispatch events.
    seq: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(
        external_id: String,
        internal_id: String,
        outbound: mpsc::UnboundedSender<GatewayMessage>,
    ) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                external_id,
                internal_id,
                connected_at: Utc::now(),
                outbound,
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn external_id(&self) -> &str {
        &self.inner.external_id
    }

    pub fn internal_id(&self) -> &str {
        &self.inner.internal_id
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.inner.connected_at
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Queue a DISPATCH frame for this connection's writer. Returns false
    /// when the connection is already gone.
    pub fn dispatch(&self, event_name: &str, data: Value) -> bool {
        let msg = GatewayMessage::dispatch(event_name, self.next_seq(), data);
        self.inner.outbound.send(msg).is_ok()
    }
}
