//! Dual-key online-user registry.
//!
//! Every admitted connection is reachable under both of the platform's id
//! namespaces for its user: the client-facing external id and the
//! storage-layer internal id. Both entries are written and removed together
//! under one lock so no partial mapping is ever observable, and the count of
//! distinct connections (not entries) is the count of online users.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use super::session::{ConnectionHandle, ConnectionId};

#[derive(Default)]
struct Maps {
    by_external: HashMap<String, ConnectionHandle>,
    by_internal: HashMap<String, ConnectionHandle>,
}

impl Maps {
    fn distinct_connections(&self) -> usize {
        let mut ids: HashSet<ConnectionId> = self.by_external.values().map(|h| h.id()).collect();
        ids.extend(self.by_internal.values().map(|h| h.id()));
        ids.len()
    }
}

pub struct OnlineRegistry {
    maps: Mutex<Maps>,
}

impl OnlineRegistry {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(Maps::default()),
        }
    }

    /// Register a connection under both of its ids. A user reconnecting
    /// before their old entries are cleared silently overwrites them
    /// (last-write-wins; no duplicate-session detection).
    pub fn register(&self, handle: ConnectionHandle) {
        let mut maps = self.maps.lock();
        maps.by_external
            .insert(handle.external_id().to_string(), handle.clone());
        maps.by_internal
            .insert(handle.internal_id().to_string(), handle);
        tracing::debug!(online = maps.distinct_connections(), "connection registered");
    }

    /// Look up a live connection by either id namespace.
    pub fn resolve(&self, identifier: &str) -> Option<ConnectionHandle> {
        let maps = self.maps.lock();
        maps.by_external
            .get(identifier)
            .or_else(|| maps.by_internal.get(identifier))
            .cloned()
    }

    /// True when the user behind either id currently has a live connection.
    pub fn is_online(&self, identifier: &str) -> bool {
        let maps = self.maps.lock();
        maps.by_external.contains_key(identifier) || maps.by_internal.contains_key(identifier)
    }

    /// Remove the entries belonging to the disconnecting connection. Entries
    /// already overwritten by a newer connection for the same user are left
    /// in place.
    pub fn deregister(&self, external_id: &str, internal_id: &str, id: ConnectionId) {
        let mut maps = self.maps.lock();
        if maps
            .by_external
            .get(external_id)
            .is_some_and(|h| h.id() == id)
        {
            maps.by_external.remove(external_id);
        }
        if maps
            .by_internal
            .get(internal_id)
            .is_some_and(|h| h.id() == id)
        {
            maps.by_internal.remove(internal_id);
        }
        tracing::debug!(online = maps.distinct_connections(), "connection deregistered");
    }

    /// Number of distinct online users. Each connection appears under two
    /// keys, so this counts connections, not entries.
    pub fn online_count(&self) -> usize {
        self.maps.lock().distinct_connections()
    }
}

impl Default for OnlineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
