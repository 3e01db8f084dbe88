//! Seam between the gateway and the application's event handlers.

use async_trait::async_trait;
use serde_json::Value;

use super::session::ConnectionHandle;

/// Business-logic consumer for inbound events that clear the rate-limit
/// gate. The chat and match services implement this; everything before it is
/// owned by the gateway.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn handle(&self, conn: &ConnectionHandle, event: &str, data: Value);
}

/// Default sink that records the event at debug level and drops it.
pub struct LogSink;

#[async_trait]
impl EventSink for LogSink {
    async fn handle(&self, conn: &ConnectionHandle, event: &str, _data: Value) {
        tracing::debug!(conn = %conn.id(), event, "event accepted with no sink attached");
    }
}
