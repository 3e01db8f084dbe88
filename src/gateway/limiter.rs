//! Per-connection, per-event-name traffic limiter.
//!
//! Each (connection, event name) pair gets a window tracking an event count
//! and a cumulative payload byte total; either cap alone denies. Windows are
//! lazy: counters reset on the first check after expiry rather than on a
//! timer, so a burst straddling a window boundary can see up to two caps of
//! traffic. A background sweep evicts windows that have sat idle past a
//! threshold; `remove_all` runs synchronously on disconnect regardless.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::WindowLimit;

use super::session::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    Deny(DenyReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    TooManyEvents,
    BandwidthExceeded,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TooManyEvents => "too_many_events",
            Self::BandwidthExceeded => "bandwidth_exceeded",
        }
    }
}

struct EventWindow {
    count: u32,
    bytes: u64,
    expires_at: Instant,
}

pub struct EventRateLimiter {
    default_limit: WindowLimit,
    overrides: HashMap<String, WindowLimit>,
    max_bytes: u64,
    idle_eviction: Duration,
    windows: DashMap<(ConnectionId, String), EventWindow>,
}

impl EventRateLimiter {
    pub fn new(
        default_limit: WindowLimit,
        overrides: HashMap<String, WindowLimit>,
        max_mb_per_window: u64,
        idle_eviction: Duration,
    ) -> Self {
        Self {
            default_limit,
            overrides,
            max_bytes: max_mb_per_window * 1024 * 1024,
            idle_eviction,
            windows: DashMap::new(),
        }
    }

    fn limit_for(&self, event: &str) -> WindowLimit {
        self.overrides.get(event).copied().unwrap_or(self.default_limit)
    }

    /// Gate one inbound event. Runs before the event reaches business logic;
    /// a denied event is never forwarded.
    pub fn check(&self, conn: ConnectionId, event: &str, payload_bytes: usize) -> RateDecision {
        let limit = self.limit_for(event);
        let now = Instant::now();
        let mut entry = self
            .windows
            .entry((conn, event.to_string()))
            .or_insert_with(|| EventWindow {
                count: 0,
                bytes: 0,
                expires_at: now + limit.window,
            });

        if now >= entry.expires_at {
            entry.count = 0;
            entry.bytes = 0;
            entry.expires_at = now + limit.window;
        }

        if entry.count >= limit.max_events {
            return RateDecision::Deny(DenyReason::TooManyEvents);
        }
        if entry.bytes + payload_bytes as u64 > self.max_bytes {
            return RateDecision::Deny(DenyReason::BandwidthExceeded);
        }

        entry.count += 1;
        entry.bytes += payload_bytes as u64;
        RateDecision::Allow
    }

    /// Drop every window belonging to a connection. Called synchronously on
    /// disconnect.
    pub fn remove_all(&self, conn: ConnectionId) {
        self.windows.retain(|(id, _), _| *id != conn);
    }

    /// Evict windows whose expiry is older than the idle threshold. Returns
    /// the number evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.expires_at) < self.idle_eviction);
        before - self.windows.len()
    }

    /// Spawn the periodic sweep task.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // First tick fires immediately; skip it.
            loop {
                ticker.tick().await;
                let evicted = limiter.sweep();
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted idle rate-limit windows");
                }
            }
        })
    }
}
