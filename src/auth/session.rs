//! Session-token verification for the WebSocket handshake.
//!
//! The core API signs a short-lived HS256 session token at login. The gateway
//! accepts it from two places, in order of preference: the named session
//! cookie (inaccessible to page-level script) or the `auth` field of the
//! client's IDENTIFY frame. A token in the URL query string is never
//! accepted, valid or not: query strings end up in proxy and browser logs.

use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a session token.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    /// External (client-facing) user id, e.g. `usr_…`.
    pub sub: String,
    /// Internal storage id for the same user, e.g. `acc_…`.
    pub uid: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
}

/// Identity pair resolved from a successful verification. Other subsystems
/// address the same user by either id, so both are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub external_id: String,
    pub internal_id: String,
}

/// Why a handshake token was rejected. The kinds stay distinct so logs and
/// metrics can tell them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    MissingToken,
    InvalidSignature,
    Expired,
    NotYetValid,
    Malformed,
}

impl VerifyError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "token_expired",
            Self::NotYetValid => "token_not_yet_valid",
            Self::Malformed => "malformed_token",
        }
    }
}

/// Token material captured from the HTTP upgrade request.
#[derive(Debug, Default)]
pub struct HandshakeMeta {
    /// Value of the session cookie, if the request carried one.
    pub cookie_token: Option<String>,
    /// Token found in the query string. Never used as a source; its presence
    /// is logged and the value discarded.
    pub query_token: Option<String>,
}

impl HandshakeMeta {
    /// Extract token material from the upgrade request's headers and query
    /// string.
    pub fn from_request(headers: &HeaderMap, query: Option<&str>, cookie_name: &str) -> Self {
        let cookie_token = headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|header| cookie_value(header, cookie_name));

        let query_token = query.and_then(query_param_token);

        Self {
            cookie_token,
            query_token,
        }
    }
}

fn cookie_value(header: &str, name: &str) -> Option<String> {
    header.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

fn query_param_token(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == "token" && !v.is_empty()).then(|| v.to_string())
    })
}

/// Validates session tokens presented at handshake time. No connection is
/// admitted to the registry without passing through here first.
pub struct TokenVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_nbf = true;
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Resolve the identity for a connection attempt.
    ///
    /// Source precedence: session cookie, then the IDENTIFY `auth` field.
    pub fn verify(
        &self,
        meta: &HandshakeMeta,
        auth_field: Option<&str>,
    ) -> Result<Identity, VerifyError> {
        if let Some(token) = &meta.query_token {
            tracing::warn!(token = %mask(token), "session token in query string ignored");
        }

        let token = meta
            .cookie_token
            .as_deref()
            .or(auth_field)
            .ok_or(VerifyError::MissingToken)?;

        match jsonwebtoken::decode::<SessionClaims>(token, &self.decoding, &self.validation) {
            Ok(data) => {
                let identity = Identity {
                    external_id: data.claims.sub,
                    internal_id: data.claims.uid,
                };
                tracing::debug!(user = %mask(&identity.external_id), "session token verified");
                Ok(identity)
            }
            Err(e) => {
                let kind = match e.kind() {
                    ErrorKind::ExpiredSignature => VerifyError::Expired,
                    ErrorKind::ImmatureSignature => VerifyError::NotYetValid,
                    ErrorKind::InvalidSignature => VerifyError::InvalidSignature,
                    _ => VerifyError::Malformed,
                };
                tracing::debug!(error = kind.reason(), "session token rejected");
                Err(kind)
            }
        }
    }
}

/// Mask an identifier to a short, non-reversible prefix for logs.
pub fn mask(id: &str) -> String {
    const VISIBLE: usize = 8;
    if id.chars().count() <= VISIBLE {
        return "***".to_string();
    }
    let prefix: String = id.chars().take(VISIBLE).collect();
    format!("{prefix}…")
}
