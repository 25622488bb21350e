//! Error types for the command protocol.

/// Errors produced while encoding or decoding listener commands.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("ambiguous command envelope: {0}")]
    Ambiguous(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),
}
