//! Errors.

use std::fmt;

/// Why the tenant registry refused a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TenantRejectKind {
    /// Deny list hit, or allow list miss.
    Deny,
    /// Concurrent connection limit reached.
    Limit,
    /// New-connection rate limit exceeded.
    Rate,
}

impl TenantRejectKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            TenantRejectKind::Deny => "deny",
            TenantRejectKind::Limit => "limit",
            TenantRejectKind::Rate => "rate",
        }
    }
}

impl fmt::Display for TenantRejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Various errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("socket error: {0}")]
    SocketError(String),
    #[error("protocol synchronization error: {0}")]
    ProtocolSyncError(String),
    #[error("bad startup message: {0}")]
    ClientBadStartup(String),
    #[error("no username in startup message")]
    UserUnspecified,
    #[error("{0}")]
    BadIdentity(String),
    #[error("client authentication failed: {0}")]
    AuthError(String),
    #[error("server authentication failed: {0}")]
    ServerAuthError(String),
    #[error("SCRAM client error: {0}")]
    ScramClientError(String),
    #[error("TLS error: {0}")]
    TlsError(String),
    #[error("bad configuration: {0}")]
    BadConfig(String),
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("pool checkout timed out: all connections in use")]
    PoolCheckoutTimeout,
    #[error("tenant '{tenant}' rejected: {message}")]
    TenantRejected {
        tenant: String,
        kind: TenantRejectKind,
        message: String,
    },
    #[error("resolver '{name}' failed: {message}")]
    ResolverError { name: String, message: String },
    #[error("required resolver '{0}' returned no rows")]
    ResolverNoRows(String),
    #[error("context injection failed: {0}")]
    InjectionFailed(String),
}

impl Error {
    /// Map a client-visible failure to its (SQLSTATE, message) pair.
    ///
    /// Returns `None` for transport-class errors, which close the socket
    /// silently, and for errors whose ErrorResponse was already forwarded
    /// from the server verbatim.
    pub fn client_response(&self) -> Option<(&'static str, String)> {
        match self {
            Error::UserUnspecified => Some(("08004", "no username in StartupMessage".to_string())),
            Error::ClientBadStartup(msg) => Some(("08004", msg.clone())),
            Error::BadIdentity(msg) => Some(("28000", msg.clone())),
            Error::AuthError(msg) => Some(("28P01", msg.clone())),
            Error::TenantRejected { message, .. } => Some(("28000", message.clone())),
            Error::HandshakeTimeout => Some((
                "57014",
                "handshake timed out before the session was established".to_string(),
            )),
            Error::PoolCheckoutTimeout => Some((
                "53300",
                "sorry, too many clients already (pool checkout timed out)".to_string(),
            )),
            Error::ResolverNoRows(name) => Some((
                "28000",
                format!("required resolver '{name}' matched no rows"),
            )),
            Error::ResolverError { name, message } => {
                Some(("28000", format!("resolver '{name}' failed: {message}")))
            }
            Error::BadConfig(msg) => Some(("28000", msg.clone())),
            // Already forwarded verbatim by the handler before the error is raised.
            Error::InjectionFailed(_) => None,
            // Transport-class: the peer observes a closed socket.
            Error::SocketError(_)
            | Error::ProtocolSyncError(_)
            | Error::ServerAuthError(_)
            | Error::ScramClientError(_)
            | Error::TlsError(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::SocketError(err.to_string())
    }
}
