//! Error types for the listener.

use tunnelrelay_protocol::ProtocolError;

/// Failures reported by a [`Transport`](crate::transport::Transport).
///
/// Cloneable so a single connect outcome can be shared by every waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("handshake rejected with HTTP {status}: {reason}")]
    Rejected { status: u16, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection closed")]
    Closed,

    #[error("connection aborted")]
    Aborted,
}

/// Failures reported by a [`TokenProvider`](crate::token::TokenProvider).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("token request failed: {0}")]
    Request(String),

    #[error("token provider closed")]
    Closed,
}

/// Errors surfaced by the listener and its control connection.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("listener is already open")]
    AlreadyOpen,

    #[error("listener is closed")]
    Closed,

    #[error("listener has not been opened")]
    NotOpen,

    #[error("listener configuration cannot change once opened")]
    ReadOnly,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("token error: {0}")]
    Token(#[from] TokenError),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,
}

impl From<ProtocolError> for ListenerError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::InvalidAddress(msg) => ListenerError::InvalidAddress(msg),
            other => ListenerError::Protocol(other.to_string()),
        }
    }
}

impl ListenerError {
    /// Wraps a transport failure observed on the control channel.
    pub(crate) fn connection_lost(e: impl std::fmt::Display) -> Self {
        ListenerError::ConnectionLost(e.to_string())
    }
}
