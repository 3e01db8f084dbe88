//! Matched-only presence fan-out.
//!
//! On every connect/disconnect the broadcaster fetches the subject's match
//! set and pushes a fresh `PRESENCE_SYNC` to each online match. Each
//! recipient gets its own recomputed view (their matches intersected with
//! who is registered right now) rather than a shared payload, because no two
//! recipients see the same list. Non-matches never observe a transition.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::json;

use crate::auth::mask;

use super::events::EventName;
use super::matches::MatchDirectory;
use super::registry::OnlineRegistry;
use super::session::ConnectionHandle;

pub struct PresenceBroadcaster {
    registry: Arc<OnlineRegistry>,
    matches: Arc<dyn MatchDirectory>,
}

impl PresenceBroadcaster {
    pub fn new(registry: Arc<OnlineRegistry>, matches: Arc<dyn MatchDirectory>) -> Self {
        Self { registry, matches }
    }

    /// Announce a presence transition for `external_id` to every online
    /// match, and (on connect) to the subject themselves.
    pub async fn announce(&self, external_id: &str, is_online: bool) {
        let subject_matches = match self.matches.matches(external_id).await {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(
                    user = %mask(external_id),
                    error = %e,
                    "match lookup failed; presence broadcast skipped"
                );
                return;
            }
        };

        // A fresh client starts from its current filtered view.
        if is_online {
            if let Some(handle) = self.registry.resolve(external_id) {
                let online = self.online_subset(&subject_matches, None);
                handle.dispatch(EventName::PRESENCE_SYNC, json!({ "online": online }));
            }
        }

        // A subject going offline is still registered while we run, so each
        // recipient's view is filtered around them explicitly.
        let exclude = (!is_online).then(|| external_id.to_string());

        // One recipient's failed lookup or dead channel must not starve the
        // rest of the fan-out.
        let deliveries = subject_matches.iter().filter_map(|match_id| {
            let handle = self.registry.resolve(match_id)?;
            Some(self.notify_recipient(match_id.clone(), handle, exclude.clone()))
        });
        join_all(deliveries).await;
    }

    async fn notify_recipient(
        &self,
        recipient_id: String,
        handle: ConnectionHandle,
        exclude: Option<String>,
    ) {
        match self.matches.matches(&recipient_id).await {
            Ok(their_matches) => {
                let online = self.online_subset(&their_matches, exclude.as_deref());
                if !handle.dispatch(EventName::PRESENCE_SYNC, json!({ "online": online })) {
                    tracing::debug!(
                        user = %mask(&recipient_id),
                        "presence push to closed connection dropped"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    user = %mask(&recipient_id),
                    error = %e,
                    "match lookup failed for presence recipient"
                );
            }
        }
    }

    /// A match set narrowed to currently-registered users, sorted for stable
    /// payloads.
    fn online_subset(&self, matches: &HashSet<String>, exclude: Option<&str>) -> Vec<String> {
        let mut online: Vec<String> = matches
            .iter()
            .filter(|id| exclude != Some(id.as_str()))
            .filter(|id| self.registry.is_online(id))
            .cloned()
            .collect();
        online.sort();
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::events::GatewayMessage;
    use crate::gateway::matches::{MatchLookupError, StaticMatchDirectory};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    fn connect(
        registry: &OnlineRegistry,
        external: &str,
        internal: &str,
    ) -> (ConnectionHandle, mpsc::UnboundedReceiver<GatewayMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(external.to_string(), internal.to_string(), tx);
        registry.register(handle.clone());
        (handle, rx)
    }

    fn online_list(msg: &GatewayMessage) -> Vec<String> {
        assert_eq!(msg.t.as_deref(), Some(EventName::PRESENCE_SYNC));
        msg.d["online"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn connect_notifies_online_matches_and_self() {
        let registry = Arc::new(OnlineRegistry::new());
        let directory = Arc::new(StaticMatchDirectory::new());
        directory.add_pair("usr_a", "usr_b");
        let broadcaster = PresenceBroadcaster::new(registry.clone(), directory);

        let (_b, mut b_rx) = connect(&registry, "usr_b", "acc_b");
        let (_a, mut a_rx) = connect(&registry, "usr_a", "acc_a");

        broadcaster.announce("usr_a", true).await;

        // A's own view includes B; B's update includes A.
        let a_msg = a_rx.try_recv().unwrap();
        assert_eq!(online_list(&a_msg), vec!["usr_b".to_string()]);

        let b_msg = b_rx.try_recv().unwrap();
        assert_eq!(online_list(&b_msg), vec!["usr_a".to_string()]);
    }

    #[tokio::test]
    async fn non_matches_receive_nothing() {
        let registry = Arc::new(OnlineRegistry::new());
        let directory = Arc::new(StaticMatchDirectory::new());
        directory.add_pair("usr_a", "usr_b");
        let broadcaster = PresenceBroadcaster::new(registry.clone(), directory);

        let (_b, mut b_rx) = connect(&registry, "usr_b", "acc_b");
        let (_c, mut c_rx) = connect(&registry, "usr_c", "acc_c");
        let (_a, _a_rx) = connect(&registry, "usr_a", "acc_a");

        broadcaster.announce("usr_a", true).await;

        assert!(b_rx.try_recv().is_ok());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_announce_excludes_the_subject() {
        let registry = Arc::new(OnlineRegistry::new());
        let directory = Arc::new(StaticMatchDirectory::new());
        directory.add_pair("usr_a", "usr_b");
        let broadcaster = PresenceBroadcaster::new(registry.clone(), directory);

        let (_b, mut b_rx) = connect(&registry, "usr_b", "acc_b");
        let (a, mut a_rx) = connect(&registry, "usr_a", "acc_a");

        // A disconnects: the de-announce runs while A is still registered.
        broadcaster.announce("usr_a", false).await;

        let b_msg = b_rx.try_recv().unwrap();
        assert!(online_list(&b_msg).is_empty());

        // The departing subject gets no self update.
        assert!(a_rx.try_recv().is_err());

        registry.deregister("usr_a", "acc_a", a.id());
    }

    #[tokio::test]
    async fn offline_matches_are_skipped() {
        let registry = Arc::new(OnlineRegistry::new());
        let directory = Arc::new(StaticMatchDirectory::new());
        directory.add_pair("usr_a", "usr_b");
        directory.add_pair("usr_a", "usr_d");
        let broadcaster = PresenceBroadcaster::new(registry.clone(), directory);

        // Only B is online; D is matched with A but not connected.
        let (_b, mut b_rx) = connect(&registry, "usr_b", "acc_b");
        let (_a, _a_rx) = connect(&registry, "usr_a", "acc_a");

        broadcaster.announce("usr_a", true).await;

        let b_msg = b_rx.try_recv().unwrap();
        assert_eq!(online_list(&b_msg), vec!["usr_a".to_string()]);
    }

    /// Directory that fails lookups for one specific user.
    struct FlakyDirectory {
        inner: StaticMatchDirectory,
        failing: String,
    }

    #[async_trait]
    impl MatchDirectory for FlakyDirectory {
        async fn matches(&self, user_id: &str) -> Result<HashSet<String>, MatchLookupError> {
            if user_id == self.failing {
                return Err(MatchLookupError::Status(500));
            }
            self.inner.matches(user_id).await
        }
    }

    #[tokio::test]
    async fn one_failed_recipient_does_not_abort_the_fanout() {
        let registry = Arc::new(OnlineRegistry::new());
        let inner = StaticMatchDirectory::new();
        inner.add_pair("usr_a", "usr_b");
        inner.add_pair("usr_a", "usr_c");
        let directory = Arc::new(FlakyDirectory {
            inner,
            failing: "usr_b".to_string(),
        });
        let broadcaster = PresenceBroadcaster::new(registry.clone(), directory);

        let (_b, mut b_rx) = connect(&registry, "usr_b", "acc_b");
        let (_c, mut c_rx) = connect(&registry, "usr_c", "acc_c");
        let (_a, _a_rx) = connect(&registry, "usr_a", "acc_a");

        broadcaster.announce("usr_a", true).await;

        // B's recompute failed; C still got its update.
        assert!(b_rx.try_recv().is_err());
        let c_msg = c_rx.try_recv().unwrap();
        assert_eq!(online_list(&c_msg), vec!["usr_a".to_string()]);
    }

    #[tokio::test]
    async fn subject_lookup_failure_skips_the_broadcast() {
        let registry = Arc::new(OnlineRegistry::new());
        let inner = StaticMatchDirectory::new();
        inner.add_pair("usr_a", "usr_b");
        let directory = Arc::new(FlakyDirectory {
            inner,
            failing: "usr_a".to_string(),
        });
        let broadcaster = PresenceBroadcaster::new(registry.clone(), directory);

        let (_b, mut b_rx) = connect(&registry, "usr_b", "acc_b");
        let (_a, _a_rx) = connect(&registry, "usr_a", "acc_a");

        broadcaster.announce("usr_a", true).await;
        assert!(b_rx.try_recv().is_err());
    }
}
