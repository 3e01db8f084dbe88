//! Connection-terminal error classification and application close codes.

use crate::auth::session::VerifyError;

/// Close codes (4000-range for application-level).
pub const CLOSE_PROTOCOL_ERROR: u16 = 4000;
pub const CLOSE_UNKNOWN_OPCODE: u16 = 4001;
pub const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
pub const CLOSE_AUTH_FAILED: u16 = 4004;
pub const CLOSE_TOO_MANY_CONNECTIONS: u16 = 4008;
pub const CLOSE_SESSION_TIMEOUT: u16 = 4009;

/// Terminal failure of a connection attempt. Carries the close code and the
/// machine-readable reason string sent in the close frame. Handshake failures
/// are not retried by the gateway; the client may reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeError {
    /// Token missing or failed verification; see the inner kind.
    Auth(VerifyError),
    /// Too many recent connection attempts for this identity.
    AdmissionDenied,
    /// IDENTIFY did not arrive within the handshake deadline.
    Timeout,
    /// The first frame was something other than IDENTIFY.
    NotIdentified,
    /// Unparseable traffic during the handshake.
    Protocol(&'static str),
}

impl HandshakeError {
    pub fn close_code(&self) -> u16 {
        match self {
            Self::Auth(_) => CLOSE_AUTH_FAILED,
            Self::AdmissionDenied => CLOSE_TOO_MANY_CONNECTIONS,
            Self::Timeout => CLOSE_SESSION_TIMEOUT,
            Self::NotIdentified => CLOSE_NOT_AUTHENTICATED,
            Self::Protocol(_) => CLOSE_PROTOCOL_ERROR,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Auth(kind) => kind.reason(),
            Self::AdmissionDenied => "too_many_connections",
            Self::Timeout => "handshake_timeout",
            Self::NotIdentified => "expected_identify",
            Self::Protocol(reason) => reason,
        }
    }
}
