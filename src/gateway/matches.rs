//! Match-graph lookup collaborator.
//!
//! The match graph is owned by the core API; the gateway reads it fresh on
//! every presence broadcast and never caches it, since matches change
//! between gateway-level events.

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;

#[derive(Debug)]
pub enum MatchLookupError {
    Transport(String),
    Status(u16),
}

impl fmt::Display for MatchLookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "match lookup transport error: {e}"),
            Self::Status(code) => write!(f, "match lookup returned status {code}"),
        }
    }
}

/// Read-only view of the mutual-match graph.
#[async_trait]
pub trait MatchDirectory: Send + Sync {
    /// External ids of the users this user has mutually matched with.
    /// Unknown users yield an empty set, not an error.
    async fn matches(&self, user_id: &str) -> Result<HashSet<String>, MatchLookupError>;
}

/// Directory backed by the core API's internal matches endpoint.
pub struct HttpMatchDirectory {
    base_url: String,
    http: reqwest::Client,
}

impl HttpMatchDirectory {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct MatchesResponse {
    matches: Vec<String>,
}

#[async_trait]
impl MatchDirectory for HttpMatchDirectory {
    async fn matches(&self, user_id: &str) -> Result<HashSet<String>, MatchLookupError> {
        let url = format!("{}/internal/users/{}/matches", self.base_url, user_id);

        let resp = self.http.get(&url).send().await.map_err(|e| {
            tracing::error!(?e, "match lookup request failed");
            MatchLookupError::Transport(e.to_string())
        })?;

        // Users the core API does not know about simply have no matches.
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(HashSet::new());
        }
        if !resp.status().is_success() {
            return Err(MatchLookupError::Status(resp.status().as_u16()));
        }

        let body: MatchesResponse = resp.json().await.map_err(|e| {
            tracing::error!(?e, "match lookup response parse failed");
            MatchLookupError::Transport(e.to_string())
        })?;

        Ok(body.matches.into_iter().collect())
    }
}

/// In-memory directory for tests and local development.
#[derive(Default)]
pub struct StaticMatchDirectory {
    pairs: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticMatchDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mutual match between two users.
    pub fn add_pair(&self, a: &str, b: &str) {
        let mut pairs = self.pairs.write();
        pairs.entry(a.to_string()).or_default().insert(b.to_string());
        pairs.entry(b.to_string()).or_default().insert(a.to_string());
    }
}

#[async_trait]
impl MatchDirectory for StaticMatchDirectory {
    async fn matches(&self, user_id: &str) -> Result<HashSet<String>, MatchLookupError> {
        Ok(self.pairs.read().get(user_id).cloned().unwrap_or_default())
    }
}
