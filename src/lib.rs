pub mod auth;
pub mod config;
pub mod error;
pub mod gateway;

use std::sync::Arc;

use auth::session::TokenVerifier;
use config::Config;
use gateway::admission::AdmissionController;
use gateway::limiter::EventRateLimiter;
use gateway::matches::MatchDirectory;
use gateway::presence::PresenceBroadcaster;
use gateway::registry::OnlineRegistry;
use gateway::session::ConnectionHandle;
use gateway::sink::EventSink;

/// Shared application state available to all connection handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<TokenVerifier>,
    pub registry: Arc<OnlineRegistry>,
    pub admission: Arc<AdmissionController>,
    pub limiter: Arc<EventRateLimiter>,
    pub matches: Arc<dyn MatchDirectory>,
    pub presence: Arc<PresenceBroadcaster>,
    pub sink: Arc<dyn EventSink>,
}

impl AppState {
    /// Wire the gateway's components from a config plus the two injected
    /// collaborators: the match directory and the business-logic event sink.
    pub fn new(config: Config, matches: Arc<dyn MatchDirectory>, sink: Arc<dyn EventSink>) -> Self {
        let config = Arc::new(config);
        let verifier = Arc::new(TokenVerifier::new(&config.session_secret));
        let registry = Arc::new(OnlineRegistry::new());
        let admission = Arc::new(AdmissionController::new(
            config.admission_cap,
            config.admission_window,
        ));
        let limiter = Arc::new(EventRateLimiter::new(
            config.event_limit,
            config.event_overrides.clone(),
            config.max_mb_per_window,
            config.idle_eviction,
        ));
        let presence = Arc::new(PresenceBroadcaster::new(registry.clone(), matches.clone()));

        Self {
            config,
            verifier,
            registry,
            admission,
            limiter,
            matches,
            presence,
            sink,
        }
    }

    /// Socket lookup for the chat/match services: find the live connection
    /// for a user by either the external or the internal identifier.
    pub fn resolve_connection(&self, identifier: &str) -> Option<ConnectionHandle> {
        self.registry.resolve(identifier)
    }
}
