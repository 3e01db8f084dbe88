//! Sliding-window connection admission per identity.
//!
//! This is a windowed attempt counter, not a concurrency gauge: `admit`
//! counts attempts inside a fixed window that lazily resets on the first
//! attempt after expiry, and `release` decrements the live window (floored
//! at zero, a no-op once the window has rolled over). Under a reconnect
//! storm the count can drift from the number of open sockets; that behavior
//! is intentional and kept as-is.

use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny,
}

struct AttemptWindow {
    count: u32,
    expires_at: Instant,
}

pub struct AdmissionController {
    cap: u32,
    window: Duration,
    attempts: DashMap<String, AttemptWindow>,
}

impl AdmissionController {
    pub fn new(cap: u32, window: Duration) -> Self {
        Self {
            cap,
            window,
            attempts: DashMap::new(),
        }
    }

    /// Count a connection attempt for this identity.
    pub fn admit(&self, external_id: &str) -> Admission {
        let now = Instant::now();
        let mut entry = self
            .attempts
            .entry(external_id.to_string())
            .or_insert_with(|| AttemptWindow {
                count: 0,
                expires_at: now + self.window,
            });

        if now >= entry.expires_at {
            entry.count = 1;
            entry.expires_at = now + self.window;
            return Admission::Allow;
        }

        if entry.count < self.cap {
            entry.count += 1;
            Admission::Allow
        } else {
            Admission::Deny
        }
    }

    /// Give the attempt back on disconnect. Floored at zero; a window that
    /// has already rolled over is left alone.
    pub fn release(&self, external_id: &str) {
        if let Some(mut entry) = self.attempts.get_mut(external_id) {
            if Instant::now() < entry.expires_at {
                entry.count = entry.count.saturating_sub(1);
            }
        }
    }
}
