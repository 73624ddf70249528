//! Error types for the proxy.

use crate::protocol::{Envelope, RequestId, Response};
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors surfaced by the proxy engine.
///
/// Session lifecycle errors (`MissingSession`, `SessionNotFound`,
/// `ConnectionLost`) map to JSON-RPC code `-32000`; relay failures map to
/// `-32603`. Upstream JSON-RPC errors are not represented here: they are
/// passed through verbatim inside the response envelope.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to establish the upstream transport.
    #[error("failed to connect to upstream: {0}")]
    TransportSetup(String),

    /// The upstream transport closed while requests were outstanding.
    #[error("upstream connection closed")]
    UpstreamClosed,

    /// I/O failure while talking to the upstream.
    #[error("upstream i/o error: {0}")]
    UpstreamIo(String),

    /// A forwarded request did not complete within the configured timeout.
    #[error("upstream request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// A non-initialize request arrived without a session id header.
    #[error("Missing session ID")]
    MissingSession,

    /// The presented session id is not bound to any connection.
    #[error("Session not found")]
    SessionNotFound,

    /// The session's connection failed validation and was cleaned up.
    #[error("Connection lost, please reinitialize")]
    ConnectionLost,

    /// The request body was not a well-formed JSON-RPC envelope.
    #[error("invalid request body: {0}")]
    BodyParse(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// JSON-RPC error code this error surfaces as.
    pub fn json_rpc_code(&self) -> i64 {
        match self {
            ProxyError::MissingSession
            | ProxyError::SessionNotFound
            | ProxyError::ConnectionLost => crate::protocol::error_codes::SESSION_ERROR,
            ProxyError::BodyParse(_) => crate::protocol::error_codes::PARSE_ERROR,
            _ => crate::protocol::error_codes::INTERNAL_ERROR,
        }
    }

    /// Render this error as a JSON-RPC error envelope under `id`.
    pub fn to_envelope(&self, id: RequestId) -> Envelope {
        Envelope::Response(Response::error(id, self.json_rpc_code(), self.to_string()))
    }
}
